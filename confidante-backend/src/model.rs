use confidante_core::xml::Element;
use confidante_core::xmpp::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    To,
    From,
    Both,
}

#[derive(Debug, Clone)]
pub struct RosterItem {
    pub owner: String,
    pub contact: Jid,
    pub name: Option<String>,
    pub subscription: Subscription,
    pub ask: bool,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RosterNotification {
    pub contact_username: String,
    pub originator: Jid,
    pub presence: Element,
}

#[derive(Debug, Clone)]
pub struct BlockListItem {
    pub owner: String,
    pub jid_pattern: Jid,
}

#[derive(Debug, Clone)]
pub struct OfflineMessage {
    pub owner: String,
    pub stanza: Element,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubAffiliation {
    Owner,
    Publisher,
    Member,
    None,
}

#[derive(Debug, Clone)]
pub struct PubSubItem {
    pub id: String,
    pub payload: Element,
}

#[derive(Debug, Clone, Default)]
pub struct PubSubNode {
    pub items: Vec<PubSubItem>,
    pub subscribers: Vec<Jid>,
    pub affiliations: Vec<(Jid, PubSubAffiliation)>,
}
