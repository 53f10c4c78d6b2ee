use clap::{Parser, Subcommand};

use confidante_backend::blocklist::{BlockListHandle, fake::FakeBlockListBackend};
use confidante_backend::last_activity::{LastActivityHandle, fake::FakeLastActivityBackend};
use confidante_backend::offline::{OfflineHandle, fake::FakeOfflineBackend};
use confidante_backend::private_xml::{PrivateXmlHandle, fake::FakePrivateXmlBackend};
use confidante_backend::pubsub::{PubSubHandle, fake::FakePubSubBackend};
use confidante_backend::roster::{RosterHandle, fake::FakeRosterBackend};
use confidante_backend::settings::{KeepaliveSettings, ResourceConflictPolicy, Settings};
use confidante_backend::store::{SqliteStoreBackend, StoreHandle};
use confidante_backend::vcard::{VCardHandle, fake::FakeVCardBackend};
use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use confidante_core::xmpp::jid::Jid;
use confidante_inbound::connection::debug::DebugConnection;
use confidante_inbound::connection::tcp::TcpConnection;
use confidante_inbound::{ConnectionType, InboundStreamSettings};
use confidante_inbound::{
    InboundStream,
    sasl::{StoredPassword, StoredPasswordArgon2, StoredPasswordScram},
};
use confidante_modules::ModuleHandles;
use confidante_outbound::{OutboundProvider, OutboundSettings};
use confidante_services::dispatch::DispatchHandle;
use confidante_services::hosts::HostRegistry;
use confidante_services::presence::PresenceHandle;
use confidante_services::router::RouterHandle;
use sha1::Sha1;
use sha2::Sha256;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    AddUser { bare_jid: String, password: String },
    RemoveUser { bare_jid: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let settings = Settings::init()?;

    let store_backend = SqliteStoreBackend::new(&settings).await?;
    let store = StoreHandle::new(store_backend);

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::AddUser { bare_jid, password }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            let stored_password_argon2 = StoredPasswordArgon2::new(&password)?.to_string();
            let stored_password_scram_sha1 =
                StoredPasswordScram::<Sha1>::new(&password)?.to_string();
            let stored_password_scram_sha256 =
                StoredPasswordScram::<Sha256>::new(&password)?.to_string();
            store
                .add_user(
                    bare_jid,
                    stored_password_argon2,
                    stored_password_scram_sha1,
                    stored_password_scram_sha256,
                )
                .await?;
        }
        Some(Commands::RemoveUser { bare_jid }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            store.remove_user(bare_jid).await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:5222").await?;

            let domains = if settings.hosts.is_empty() {
                vec![settings.domain.domain().to_string()]
            } else {
                settings.hosts.iter().map(|host| host.name.clone()).collect()
            };
            let hosts = HostRegistry::new(domains);
            let blocklist = BlockListHandle::new(FakeBlockListBackend::default());
            let offline = OfflineHandle::new(FakeOfflineBackend::default());
            let roster = RosterHandle::new(FakeRosterBackend::default());
            let last_activity = LastActivityHandle::new(FakeLastActivityBackend::default());
            let private_xml = PrivateXmlHandle::new(FakePrivateXmlBackend::default());
            let vcard = VCardHandle::new(FakeVCardBackend::default());
            let pubsub = PubSubHandle::new(FakePubSubBackend::default());
            let (remote_tx, remote_rx) = tokio::sync::mpsc::channel(128);

            let router = RouterHandle::new(hosts.clone(), blocklist.clone(), offline.clone(), store.clone(), remote_tx);
            let presence =
                PresenceHandle::new(hosts, roster.clone(), last_activity.clone(), offline, router.stanzas.clone());

            let module_routes = confidante_modules::build_routes(ModuleHandles {
                domain: settings.domain.domain().to_string(),
                router: router.stanzas.clone(),
                enabled: settings.modules.enabled.clone(),
                private_xml,
                vcard,
                pubsub,
                blocklist,
                store: store.clone(),
                roster,
                presence: presence.clone(),
                last_activity,
                server_name: "confidante".to_string(),
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                server_os: std::env::consts::OS.to_string(),
            });
            let dispatch = DispatchHandle::new(module_routes, router.stanzas.clone());

            if let Some(s2s) = &settings.s2s {
                let outbound = OutboundProvider::new(
                    settings.domain.domain().to_string(),
                    settings.tls.client_config.clone(),
                    OutboundSettings {
                        dialback_secret: s2s.dialback_secret.clone(),
                        timeout_secs: s2s.timeout_secs,
                        max_stanza_size: s2s.max_stanza_size,
                    },
                    router.clone(),
                );
                outbound.spawn(remote_rx);
            }

            loop {
                let (connection, _) = listener.accept().await?;

                let settings = settings.clone();
                let router = router.clone();
                let dispatch = dispatch.clone();
                let presence = presence.clone();
                let store = store.clone();

                tokio::spawn(async move {
                    let connection =
                        TcpConnection::new(connection, settings.tls.server_config.clone(), true);
                    let connection = DebugConnection::try_new(connection).await.unwrap();
                    println!("New connection: {}", connection.uuid());

                    let c2s = settings.c2s.first();
                    let compression_enabled = c2s.map(|c2s| c2s.compression_enabled).unwrap_or(true);
                    let resource_conflict =
                        c2s.map(|c2s| c2s.resource_conflict).unwrap_or(ResourceConflictPolicy::Reject);
                    let keepalive = c2s.map(|c2s| c2s.keepalive).unwrap_or(KeepaliveSettings::default());
                    let settings = InboundStreamSettings {
                        connection_type: ConnectionType::Client,
                        domain: settings.domain.clone(),
                        tls_required: settings.tls.required_for_clients,
                        compression_enabled,
                        resource_conflict,
                        keepalive,
                    };
                    let mut stream = InboundStream::<_, RustyXmlStreamParser<_>, _>::with_modules(
                        connection,
                        router,
                        Some(dispatch),
                        Some(presence),
                        store,
                        settings,
                    );
                    stream.handle().await;
                });
            }
        }
    }

    Ok(())
}
