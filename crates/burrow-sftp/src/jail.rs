//! Export-root containment check.
//!
//! NIST 800-53: AC-3 (Access Enforcement)
//! Every path a client names must fall under the exported source directory;
//! anything else is answered `PERMISSION_DENIED` before the filesystem is
//! touched.

/// True iff `candidate` lies inside the exported `source` subtree.
///
/// A plain byte-prefix comparison: the mount helper presents normalized
/// absolute host paths, so no path cleaning or symlink resolution happens
/// here. An empty source admits nothing.
pub fn is_inside(source: &str, candidate: &str) -> bool {
    if source.is_empty() {
        return false;
    }

    candidate.as_bytes().starts_with(source.as_bytes())
}
