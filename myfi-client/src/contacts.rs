//! Client for the MyFi contacts API.
//!
//! The backend answers `GET /call/api/contacts` with the user's address book. Only entries linked
//! to a MyFi account (`myfi_user_id`) can be called; everything else is skipped.

use crate::config::APP_USER_AGENT;
use anyhow::Context;
use async_trait::async_trait;
use myfi_call::{Contact, ContactDirectory};
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Deserialize)]
struct ContactsResponse {
    success: bool,
    #[serde(default)]
    contacts: Vec<ContactEntry>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContactEntry {
    name: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    myfi_user_id: Option<UserId>,
    #[serde(default)]
    online: bool,
}

/// Account IDs come back as strings or plain integers depending on the backend store.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserId {
    Text(String),
    Number(i64),
}

impl ContactEntry {
    fn into_contact(self) -> Option<Contact> {
        let id = match self.myfi_user_id? {
            UserId::Text(id) if id.is_empty() => return None,
            UserId::Text(id) => id,
            UserId::Number(id) => id.to_string(),
        };
        Some(Contact {
            id,
            display_name: self.name,
            phone: self.phone.filter(|phone| !phone.is_empty()),
            online: self.online,
        })
    }
}

/// Contact directory backed by the MyFi HTTP API.
pub struct HttpContactDirectory {
    /// HTTP client used for all requests.
    client: reqwest::Client,
    /// Full URL of the contacts endpoint.
    contacts_url: String,
}

impl HttpContactDirectory {
    pub fn new(contacts_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            contacts_url: contacts_url.into(),
        })
    }

    /// Fetches all callable contacts.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn contacts(&self) -> anyhow::Result<Vec<Contact>> {
        tracing::trace!(url = %self.contacts_url, "Fetching contacts");

        let response: ContactsResponse = self
            .client
            .get(&self.contacts_url)
            .send()
            .await
            .context("Failed to perform HTTP request")?
            .error_for_status()
            .context("Received non-200 HTTP status code")?
            .json()
            .await
            .context("Failed to parse contacts response")?;

        if !response.success {
            anyhow::bail!(
                "Contacts request failed: {}",
                response.error.as_deref().unwrap_or("unknown error")
            );
        }

        let contacts: Vec<Contact> = response
            .contacts
            .into_iter()
            .filter_map(ContactEntry::into_contact)
            .collect();
        tracing::trace!(count = contacts.len(), "Fetched contacts");
        Ok(contacts)
    }
}

#[async_trait]
impl ContactDirectory for HttpContactDirectory {
    async fn lookup(&self, peer_id: &str) -> anyhow::Result<Option<Contact>> {
        Ok(self
            .contacts()
            .await?
            .into_iter()
            .find(|contact| contact.id == peer_id))
    }
}
