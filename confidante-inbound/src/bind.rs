use anyhow::{Error, bail};
use tokio::io::ReadHalf;
use tracing::debug;

use confidante_backend::settings::ResourceConflictPolicy;
use confidante_core::{
    xml::{Element, namespaces, stream_parser::StreamParser},
    xmpp::{
        jid::Jid,
        stream::{Connection, XmppStream},
    },
};
use confidante_services::router::RouterHandle;

pub struct ResourceBindingNegotiator {
    _private: (),
}

impl ResourceBindingNegotiator {
    pub fn advertise_feature() -> Element {
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        bind.set_attribute("xmlns", None::<String>, namespaces::XMPP_BIND.to_string());

        bind
    }

    /// `Ok(Some(jid))` is a normal successful bind, for the caller to
    /// register as usual. `Ok(None)` means a `Reject`-policy conflict was
    /// found: the iq error was already written to the stream here, so the
    /// caller has nothing further to do. `Override`/`Replace` both bind
    /// normally; the router's registration map overwriting the same full
    /// jid key is what actually evicts the superseded stream's routing
    /// entry, without forcing its socket closed.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        entity: &Option<Jid>,
        router: &RouterHandle,
        resource_conflict: ResourceConflictPolicy,
    ) -> Result<Option<Jid>, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("iq", Some(namespaces::XMPP_CLIENT)) {
            bail!("expected IQ stanza");
        }

        if element.attribute("type", None) != Some("set") {
            bail!("IQ stanza is not of type set");
        };

        let Some(request_id) = element.attribute("id", None) else {
            bail!("IQ stanza does not have an id");
        };

        let Some(bind_request) = element.find_child("bind", Some(namespaces::XMPP_BIND)) else {
            bail!("IQ stanza does not contain a bind request");
        };

        let resource = match bind_request.find_child("resource", Some(namespaces::XMPP_BIND)) {
            Some(requested_resource) => requested_resource.text(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let Some(entity) = entity else {
            bail!("entity to bind is unknown");
        };

        let bound_entity = entity.with_resource(&resource)?;

        if matches!(resource_conflict, ResourceConflictPolicy::Reject) && router.is_bound(&bound_entity).await {
            debug!(jid = %bound_entity, "rejected resource bind: resource already in use");
            let mut error_response = Element::new("iq", None);
            error_response.set_attribute("id", None::<String>, request_id.to_string());
            error_response.set_attribute("type", None::<String>, "error".to_string());
            error_response.add_child(bind_request.clone());
            error_response.with_child("error", None, |error| {
                error.set_attribute("type", None::<String>, "cancel");
                error.with_child("conflict", Some(namespaces::XMPP_STANZA_ERRORS), |_| {});
            });
            stream.writer().write_xml_element(&error_response).await?;
            return Ok(None);
        }

        debug!(jid = %bound_entity, "bound resource");

        let mut bind_response = Element::new("iq", None);
        bind_response.set_attribute("id", None::<String>, request_id.to_string());
        bind_response.set_attribute("type", None::<String>, "result".to_string());
        bind_response.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            bind.set_attribute("xmlns", None::<String>, namespaces::XMPP_BIND.to_string());
            bind.with_child("jid", None, |jid| {
                jid.add_text(format!("{}", bound_entity));
            });
        });

        stream.writer().write_xml_element(&bind_response).await?;

        Ok(Some(bound_entity))
    }
}
