pub mod message;
pub mod session;

pub use message::{CtcpPrivmsg, IrcLine};
pub use session::{IrcHandle, IrcSession, Outbound, SessionConfig};
