pub mod serialize;
pub mod utils;
pub mod xml;
pub mod xmpp;
