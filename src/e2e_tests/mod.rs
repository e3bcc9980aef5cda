//! End-to-end handshake tests
//!
//! Drives full NEGOTIATE / CHALLENGE / AUTHENTICATE exchanges between an
//! [`Initiator`](crate::auth::Initiator) and an in-process NTLM acceptor that
//! verifies responses, MICs and signatures the way a server would.

pub mod acceptor;
pub mod test_context;


pub use acceptor::{AcceptedSession, TestAcceptor};
pub use test_context::{ScriptedRng, TestContext};
