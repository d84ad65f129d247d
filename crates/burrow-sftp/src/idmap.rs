//! Uid/gid translation across the guest/host boundary.
//!
//! Mappings are small ordered lists of `(outside, inside)` pairs configured
//! once per session. Forward translation (host ids going out in replies) has
//! an identity fallback; reverse translation (guest ids arriving in setstat,
//! mkdir and open requests) does not — unknown inside ids fall through to the
//! caller-supplied default, usually the owner of the containing directory.

/// Outside-id sentinel: the remote side expressed no opinion.
pub const NO_ID_INFO: i64 = -1;

/// Inside-id sentinel: use the configured server default.
pub const DEFAULT_ID: i64 = -1;

/// Ordered `(outside, inside)` pairs.
pub type IdMappings = Vec<(i64, i64)>;

/// Bidirectional uid and gid mapping table.
///
/// Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    uid_mappings: IdMappings,
    gid_mappings: IdMappings,
    default_uid: i64,
    default_gid: i64,
}

impl IdMap {
    pub fn new(
        uid_mappings: IdMappings,
        gid_mappings: IdMappings,
        default_uid: i64,
        default_gid: i64,
    ) -> Self {
        Self {
            uid_mappings,
            gid_mappings,
            default_uid,
            default_gid,
        }
    }

    /// Translate a host uid for a reply.
    pub fn mapped_uid(&self, uid: i64) -> i64 {
        mapped_id(&self.uid_mappings, uid, self.default_uid)
    }

    /// Translate a host gid for a reply.
    pub fn mapped_gid(&self, gid: i64) -> i64 {
        mapped_id(&self.gid_mappings, gid, self.default_gid)
    }

    /// Translate a guest uid back to a host uid.
    pub fn reverse_uid(&self, uid: i64, rev_uid_if_not_found: i64) -> i64 {
        reverse_id(&self.uid_mappings, uid, rev_uid_if_not_found)
    }

    /// Translate a guest gid back to a host gid.
    pub fn reverse_gid(&self, gid: i64, rev_gid_if_not_found: i64) -> i64 {
        reverse_id(&self.gid_mappings, gid, rev_gid_if_not_found)
    }
}

fn mapped_id(mappings: &IdMappings, id: i64, id_if_not_found: i64) -> i64 {
    if id == NO_ID_INFO {
        return id_if_not_found;
    }

    match mappings.iter().find(|(outside, _)| *outside == id) {
        Some((_, inside)) if *inside == DEFAULT_ID => id_if_not_found,
        Some((_, inside)) => *inside,
        None => id,
    }
}

fn reverse_id(mappings: &IdMappings, id: i64, rev_id_if_not_found: i64) -> i64 {
    mappings
        .iter()
        .find(|(_, inside)| *inside == id)
        .map_or(rev_id_if_not_found, |(outside, _)| *outside)
}

/// Read a wire id into mapper space.
///
/// An absent field means the caller had no opinion, and so does the all-ones
/// value: the field is a `u32` on the wire but carries `-1` in its 32-bit
/// two's-complement reading.
pub fn wire_id(id: Option<u32>) -> i64 {
    id.map_or(NO_ID_INFO, |v| i64::from(v as i32))
}
