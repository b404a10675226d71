//! GA4GH DRS HTTP client.
//!
//! Uploads only register metadata. [`DrsClient::register_file`] records a
//! `file://` access method pointing at the uploader's own copy and moves no
//! bytes, so a pushed object is only downloadable from hosts that can read
//! that path. Getting content into shared storage is up to whatever fronts
//! the DRS server.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{AccessUrl, ObjectDescriptor, RemoteClient};
use crate::{Error, Result};

const USER_AGENT: &str = concat!("git-drs/", env!("CARGO_PKG_VERSION"));

/// A DRS object record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrsObject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub checksums: Vec<Checksum>,
    #[serde(default)]
    pub access_methods: Vec<AccessMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub checksum: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One way of reaching an object's bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethod {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_url: Option<AccessUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_id: Option<String>,
    #[serde(
        default,
        rename = "Authorizations",
        alias = "authorizations",
        skip_serializing_if = "Option::is_none"
    )]
    pub authorizations: Option<Authorizations>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorizations {
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bearer_auth_issuers: Vec<String>,
}

impl DrsObject {
    /// Whether any access method is authorized for the given resource path.
    fn authorized_for(&self, resource: &str) -> bool {
        self.access_methods.iter().any(|m| {
            m.authorizations.as_ref().map_or(false, |a| {
                a.value == resource || a.bearer_auth_issuers.iter().any(|i| i == resource)
            })
        })
    }

    fn is_unrestricted(&self) -> bool {
        self.access_methods.iter().all(|m| m.authorizations.is_none())
    }

    /// Pick an access URL, preferring local `file://` copies, then any inline
    /// URL. `None` means the URL has to be resolved through an `access_id`.
    fn inline_access_url(&self) -> Option<&AccessUrl> {
        let urls = || {
            self.access_methods
                .iter()
                .filter_map(|m| m.access_url.as_ref())
                .filter(|u| !u.url.trim().is_empty())
        };
        urls()
            .find(|u| u.url.starts_with("file://"))
            .or_else(|| urls().next())
    }

    fn access_id(&self) -> Option<&str> {
        self.access_methods
            .iter()
            .filter_map(|m| m.access_id.as_deref())
            .find(|id| !id.is_empty())
    }
}

#[derive(Serialize)]
struct RegisterObjectsRequest<'a> {
    candidates: Vec<&'a DrsObject>,
}

/// Client for a DRS server scoped to one project.
///
/// This type is cheaply cloneable - multiple clones share the same underlying
/// HTTP agent and configuration.
#[derive(Clone)]
pub struct DrsClient {
    inner: Arc<DrsClientInner>,
}

/// Authentication method for DRS requests.
#[derive(Clone)]
enum Auth {
    /// Bearer token
    Bearer(String),
    /// Basic auth (username, password)
    Basic(String, String),
}

#[derive(Clone)]
struct DrsClientInner {
    /// Base URL of the DRS server.
    endpoint: Url,
    /// `<program>-<project>` identifier.
    project_id: String,
    /// Authorization resource path records must carry.
    resource: String,
    auth: Option<Auth>,
    agent: ureq::Agent,
}

impl DrsClient {
    /// Create a client for `project_id` (formatted `<program>-<project>`).
    pub fn new(endpoint: &str, project_id: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidUrl(format!("not a base URL: {}", endpoint)));
        }
        let resource = project_resource(project_id)?;
        Ok(DrsClient {
            inner: Arc::new(DrsClientInner {
                endpoint,
                project_id: project_id.to_string(),
                resource,
                auth: None,
                agent: ureq::Agent::new(),
            }),
        })
    }

    fn rebuild(self, f: impl FnOnce(&mut DrsClientInner)) -> Self {
        let mut inner = (*self.inner).clone();
        f(&mut inner);
        DrsClient {
            inner: Arc::new(inner),
        }
    }

    /// Scope records to an explicit organization instead of the one encoded
    /// in the project id.
    pub fn with_organization(self, organization: &str) -> Self {
        let resource = format!("/programs/{}/projects/{}", organization, self.inner.project_id);
        self.rebuild(|inner| inner.resource = resource)
    }

    /// Set authentication from a bearer token.
    pub fn with_token(self, token: &str) -> Self {
        self.rebuild(|inner| inner.auth = Some(Auth::Bearer(token.to_string())))
    }

    /// Set basic authentication credentials.
    pub fn with_auth(self, username: &str, password: &str) -> Self {
        self.rebuild(|inner| {
            inner.auth = Some(Auth::Basic(username.to_string(), password.to_string()))
        })
    }

    /// Bound every request to the server by `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.rebuild(|inner| inner.agent = ureq::AgentBuilder::new().timeout(timeout).build())
    }

    /// Get the DRS server URL.
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Authorization resource records must match.
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    fn objects_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.inner.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(self.inner.endpoint.to_string()))?
            .pop_if_empty()
            .extend(["ga4gh", "drs", "v1", "objects"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let req = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json")
            .set("User-Agent", USER_AGENT);

        match &self.inner.auth {
            Some(Auth::Bearer(token)) => req.set("Authorization", &format!("Bearer {}", token)),
            Some(Auth::Basic(username, password)) => {
                let credentials = format!("{}:{}", username, password);
                let encoded = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    credentials.as_bytes(),
                );
                req.set("Authorization", &format!("Basic {}", encoded))
            }
            None => req,
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(response: ureq::Response) -> Result<T> {
        response
            .into_json()
            .map_err(|e| Error::Http(format!("invalid DRS response: {}", e)))
    }

    /// Look up every record whose sha256 checksum is `oid`.
    pub fn objects_by_checksum(&self, oid: &str) -> Result<Vec<DrsObject>> {
        let url = self.objects_url(&["checksum", oid])?;
        let response = self.request("GET", &url).call()?;
        Self::read_json(response)
    }

    /// Resolve an access id into a concrete URL.
    pub fn access_url(&self, object_id: &str, access_id: &str) -> Result<AccessUrl> {
        let url = self.objects_url(&[object_id, "access", access_id])?;
        let response = self.request("GET", &url).call()?;
        Self::read_json(response)
    }

    /// Register a record, returning what the server stored.
    pub fn register(&self, candidate: &DrsObject) -> Result<DrsObject> {
        let url = self.objects_url(&["register"])?;
        let body = RegisterObjectsRequest {
            candidates: vec![candidate],
        };
        let response = self
            .request("POST", &url)
            .set("Content-Type", "application/json")
            .send_json(&body)?;

        let registered: Vec<DrsObject> = Self::read_json(response)?;
        registered
            .into_iter()
            .next()
            .ok_or_else(|| Error::Http("server returned no registered objects".into()))
    }

    /// Choose the record for this project among those sharing a checksum.
    fn select_record<'a>(&self, records: &'a [DrsObject]) -> Option<&'a DrsObject> {
        records
            .iter()
            .find(|r| r.authorized_for(&self.inner.resource))
            .or_else(|| records.iter().find(|r| r.is_unrestricted()))
    }

    /// Build the record describing a local file.
    fn candidate(&self, oid: &str, path: &Path) -> Result<DrsObject> {
        let meta = fs::metadata(path)?;
        let absolute = fs::canonicalize(path)?;
        let file_url = Url::from_file_path(&absolute)
            .map_err(|_| Error::InvalidUrl(format!("cannot express {} as a URL", absolute.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| oid.to_string());
        let resource = self.inner.resource.clone();

        Ok(DrsObject {
            id: record_id(&self.inner.project_id, oid),
            name,
            size: meta.len(),
            checksums: vec![Checksum {
                checksum: oid.to_string(),
                kind: "sha256".into(),
            }],
            access_methods: vec![AccessMethod {
                kind: "file".into(),
                access_url: Some(AccessUrl::new(file_url)),
                access_id: None,
                authorizations: Some(Authorizations {
                    value: resource.clone(),
                    bearer_auth_issuers: vec![resource],
                }),
            }],
        })
    }
}

impl RemoteClient for DrsClient {
    fn download_url(&self, oid: &str) -> Result<AccessUrl> {
        let records = self.objects_by_checksum(oid)?;
        let record = self.select_record(&records).ok_or_else(|| {
            Error::NotFound(format!(
                "no record for {} in project {}",
                oid, self.inner.project_id
            ))
        })?;

        if let Some(url) = record.inline_access_url() {
            return Ok(url.clone());
        }
        let access_id = record
            .access_id()
            .ok_or_else(|| Error::EmptyAccessUrl(oid.to_string()))?;
        self.access_url(&record.id, access_id)
    }

    fn register_file(&self, oid: &str, path: &Path) -> Result<ObjectDescriptor> {
        let candidate = self.candidate(oid, path)?;
        tracing::debug!(oid, id = %candidate.id, "registering DRS record");
        let registered = self.register(&candidate)?;

        Ok(ObjectDescriptor {
            id: if registered.id.is_empty() { candidate.id } else { registered.id },
            name: if registered.name.is_empty() { candidate.name } else { registered.name },
            size: candidate.size,
        })
    }
}

/// Map `<program>-<project>` to `/programs/<program>/projects/<project>`.
fn project_resource(project_id: &str) -> Result<String> {
    match project_id.split_once('-') {
        Some((program, project)) if !program.is_empty() && !project.is_empty() => {
            Ok(format!("/programs/{}/projects/{}", program, project))
        }
        _ => Err(Error::Config(format!(
            "invalid project id {:?}, expected <program>-<project>",
            project_id
        ))),
    }
}

/// Deterministic record id for an object within a project.
fn record_id(project_id: &str, oid: &str) -> String {
    let name = format!("{}:{}", project_id, oid);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}
