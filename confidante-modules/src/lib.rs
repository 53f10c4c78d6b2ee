//! The server's IQ-handling modules: disco always runs, everything else is
//! gated on the `modules.enabled` list in configuration, following the same
//! enable-by-name scheme the original server used.

pub mod xep0012;
pub mod xep0030;
pub mod xep0049;
pub mod xep0054;
pub mod xep0077;
pub mod xep0092;
pub mod xep0163;
pub mod xep0191;
pub mod xep0199;
pub mod roster;

use tokio::sync::mpsc;

use confidante_backend::blocklist::BlockListHandle;
use confidante_backend::last_activity::LastActivityHandle;
use confidante_backend::private_xml::PrivateXmlHandle;
use confidante_backend::pubsub::PubSubHandle;
use confidante_backend::roster::RosterHandle;
use confidante_backend::store::StoreHandle;
use confidante_backend::vcard::VCardHandle;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;
use confidante_services::presence::PresenceHandle;

/// Backend handles a deployment wires modules up to. Not every module needs
/// every handle; `build_routes` only touches the ones its enabled modules
/// actually use.
pub struct ModuleHandles {
    pub domain: String,
    pub router: mpsc::Sender<Stanza>,
    pub enabled: Vec<String>,
    pub private_xml: PrivateXmlHandle,
    pub vcard: VCardHandle,
    pub pubsub: PubSubHandle,
    pub blocklist: BlockListHandle,
    pub store: StoreHandle,
    pub roster: RosterHandle,
    pub presence: PresenceHandle,
    pub last_activity: LastActivityHandle,
    pub server_name: String,
    pub server_version: String,
    pub server_os: String,
}

fn is_enabled(enabled: &[String], name: &str) -> bool {
    enabled.iter().any(|m| m == name)
}

/// Builds the dispatch routes for every enabled module, including disco,
/// whose feature/identity list reflects what's enabled.
pub fn build_routes(handles: ModuleHandles) -> Vec<Route> {
    let ModuleHandles {
        domain,
        router,
        enabled,
        private_xml,
        vcard,
        pubsub,
        blocklist,
        store,
        roster,
        presence,
        last_activity,
        server_name,
        server_version,
        server_os,
    } = handles;

    let mut server_features = vec![xep0030::DISCO_INFO.to_string(), xep0030::DISCO_ITEMS.to_string()];
    let mut account_features = Vec::new();

    if is_enabled(&enabled, "last_activity") {
        server_features.push(xep0012::LAST_ACTIVITY.to_string());
        account_features.push(xep0012::LAST_ACTIVITY.to_string());
    }
    if is_enabled(&enabled, "private") {
        account_features.push(xep0049::PRIVATE.to_string());
    }
    if is_enabled(&enabled, "vcard") {
        server_features.push(xep0054::VCARD.to_string());
        account_features.push(xep0054::VCARD.to_string());
    }
    if is_enabled(&enabled, "registration") {
        server_features.push(xep0077::REGISTER.to_string());
    }
    if is_enabled(&enabled, "version") {
        server_features.push(xep0092::VERSION.to_string());
    }
    if is_enabled(&enabled, "pep") {
        account_features.push(xep0163::PUBSUB.to_string());
    }
    if is_enabled(&enabled, "blocking_command") {
        server_features.push(xep0191::BLOCKING.to_string());
        account_features.push(xep0191::BLOCKING.to_string());
    }
    if is_enabled(&enabled, "ping") {
        server_features.push(xep0199::PING.to_string());
    }

    let mut routes = vec![xep0030::spawn(router.clone(), domain.clone(), server_features, account_features)];

    if is_enabled(&enabled, "last_activity") {
        routes.push(xep0012::spawn(router.clone(), last_activity, domain.clone()));
    }
    if is_enabled(&enabled, "private") {
        routes.push(xep0049::spawn(router.clone(), private_xml));
    }
    if is_enabled(&enabled, "vcard") {
        routes.push(xep0054::spawn(router.clone(), vcard));
    }
    if is_enabled(&enabled, "registration") {
        routes.push(xep0077::spawn(router.clone(), store, domain.clone()));
    }
    if is_enabled(&enabled, "version") {
        routes.push(xep0092::spawn(router.clone(), server_name, server_version, server_os));
    }
    if is_enabled(&enabled, "pep") {
        routes.push(xep0163::spawn(router.clone(), pubsub, roster.clone(), presence.clone()));
    }
    if is_enabled(&enabled, "blocking_command") {
        routes.push(xep0191::spawn(router.clone(), blocklist, presence));
    }
    if is_enabled(&enabled, "ping") {
        routes.push(xep0199::spawn(router.clone()));
    }
    if is_enabled(&enabled, "roster") {
        routes.push(roster::spawn(router.clone(), roster));
    }

    routes
}
