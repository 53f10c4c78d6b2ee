use std::fmt::{self, Display, Formatter};

use base64::prelude::*;
use rand::{RngCore, SeedableRng};

use super::jid::Jid;

/// Opaque stream identifier sent as the `id` attribute of `<stream:stream>`.
#[derive(Debug, Clone)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut raw = [0u8; 16];
        rng.fill_bytes(&mut raw);
        Self(BASE64_STANDARD.encode(raw))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(pub String);

impl Display for LanguageTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The attributes carried by an opening `<stream:stream>` tag, in either
/// direction.
#[derive(Debug)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub language: Option<LanguageTag>,
}
