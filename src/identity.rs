use crate::config::IdentityConfig;
use crate::error::ExecError;

/// A numeric uid/gid pair a runner is executed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Sequential uid/gid allocator.
///
/// Owned by the daemon loop; only `createNewUser` instructions advance it,
/// and it never wraps. Once `max_uid` is reached the daemon has to be
/// restarted by its supervisor.
#[derive(Debug)]
pub struct IdentityAllocator {
    current: Identity,
    max_uid: u32,
}

impl IdentityAllocator {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            current: Identity {
                uid: config.starting_uid,
                gid: config.starting_gid,
            },
            max_uid: config.max_uid,
        }
    }

    /// The pair ordinary exec instructions run as.
    pub fn current(&self) -> Identity {
        self.current
    }

    /// Advances both ids by one. The counter is left untouched when the
    /// next uid would exceed `max_uid`.
    pub fn allocate(&mut self) -> Result<Identity, ExecError> {
        let next = self
            .current
            .uid
            .checked_add(1)
            .filter(|uid| *uid <= self.max_uid)
            .ok_or(ExecError::IdentityExhausted {
                uid: self.current.uid.saturating_add(1),
                max_uid: self.max_uid,
            })?;
        self.current = Identity {
            uid: next,
            gid: self.current.gid.saturating_add(1),
        };
        Ok(self.current)
    }
}
