//! Client side of a LiveView channel: join credentials scraped from the
//! rendered page, the framed JSON wire codec, and a sans-IO driver that
//! paces one simulated session.

pub mod bootstrap;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod message;

pub use bootstrap::{Bootstrap, JoinCredentials, Topic};
pub use driver::{Action, ExchangePlan, ReplyCheck, ReplyKind, SessionDriver, SessionPhase};
pub use endpoint::Endpoint;
pub use error::{ChannelError, CredentialField};
pub use message::{Frame, Message, decode, encode, is_successful_reply};
