pub mod blocklist;
pub mod last_activity;
pub mod model;
pub mod offline;
pub mod private_xml;
pub mod pubsub;
pub mod roster;
pub mod settings;
pub mod store;
pub mod vcard;
