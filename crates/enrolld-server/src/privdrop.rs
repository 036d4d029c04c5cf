use nix::unistd::{setgid, Group};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivDropError {
    #[error("group '{0}' not found")]
    UnknownGroup(String),
    #[error("failed to drop to group {0}: {1}")]
    SetGid(u32, nix::Error),
}

/// Drops the process's group id to `group_name` after the listening
/// socket is bound (spec.md §4.7 "privilege-dropping... wrapper"). No
/// chroot and no user-id drop: out of scope per spec.md, which names this
/// only as an external collaborator the supervisor calls once at startup.
pub fn drop_group(group_name: &str) -> Result<(), PrivDropError> {
    let group = Group::from_name(group_name)
        .map_err(|_| PrivDropError::UnknownGroup(group_name.to_string()))?
        .ok_or_else(|| PrivDropError::UnknownGroup(group_name.to_string()))?;
    setgid(group.gid).map_err(|err| PrivDropError::SetGid(group.gid.as_raw(), err))
}
