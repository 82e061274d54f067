use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::{Gid, Uid, User};

/// The caller's verified identity, resolved once per request from the
/// connection's kernel-supplied credentials. Nothing here comes from the
/// request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: Uid,
    /// Primary group from the passwd record, not from the socket.
    pub gid: Gid,
    pub groups: Vec<Gid>,
    /// Canonical account name; used as the registry layer key.
    pub user_name: String,
}

/// Resolves the peer's identity from `SO_PEERCRED` plus the system
/// identity database. Fails closed: a connection whose uid the kernel
/// cannot vouch for, or that maps to no account, yields an error.
pub fn resolve_peer(stream: &UnixStream) -> Result<PeerIdentity> {
    let creds =
        getsockopt(stream, PeerCredentials).context("failed to get peer socket credentials")?;
    let uid = Uid::from_raw(creds.uid());

    // Reentrant passwd lookup; nix grows the buffer on ERANGE.
    let user = User::from_uid(uid)
        .with_context(|| format!("passwd lookup failed for peer uid {uid}"))?
        .with_context(|| format!("no account found for peer uid {uid}"))?;

    // Supplementary groups are optional; a kernel without SO_PEERGROUPS
    // simply yields none.
    let groups = peer_groups(stream).unwrap_or_default();

    Ok(PeerIdentity {
        uid,
        gid: user.gid,
        groups,
        user_name: user.name,
    })
}

/// Queries `SO_PEERGROUPS` (Linux 4.13+) with a growing buffer. The
/// kernel reports the required length through `optlen` on ERANGE.
fn peer_groups(stream: &UnixStream) -> Option<Vec<Gid>> {
    let fd = stream.as_raw_fd();
    let gid_size = mem::size_of::<libc::gid_t>();
    let mut capacity = 32usize;

    loop {
        let mut buf = vec![0 as libc::gid_t; capacity];
        let mut len = (buf.len() * gid_size) as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERGROUPS,
                buf.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rc == 0 {
            buf.truncate(len as usize / gid_size);
            return Some(buf.into_iter().map(Gid::from_raw).collect());
        }
        if io::Error::last_os_error().raw_os_error() == Some(libc::ERANGE) {
            capacity = (len as usize / gid_size).max(capacity * 2);
            continue;
        }
        return None;
    }
}
