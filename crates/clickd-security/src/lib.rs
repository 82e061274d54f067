mod credentials;
mod scoped_open;

pub use credentials::{resolve_peer, PeerIdentity};
pub use scoped_open::{open_as_identity, PrivilegeScope};
