//! Session lifecycle model.
//!
//! The single channel session moves through [`SessionStatus`] states as the
//! driver reports progress. [`Session`] records the status together with
//! activity timestamps and the reconnect counter; [`PairingManager`] keeps the
//! scannable code while the account is unpaired.

pub mod pairing;
pub mod session;
pub mod status;

pub use {
    pairing::{PairingChallenge, PairingError, PairingManager, render_svg, render_terminal},
    session::{Applied, PendingReconnect, Session, SessionSnapshot},
    status::{SessionStatus, TransitionError},
};
