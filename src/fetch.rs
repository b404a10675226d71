//! Opening access URLs for streaming downloads.

use std::fs::File;
use std::io::Read;
use std::time::Duration;
use url::Url;

use crate::remote::AccessUrl;
use crate::{Error, Result};

/// Opens `http(s)://` and `file://` access URLs as byte streams.
#[derive(Clone)]
pub struct Fetcher {
    agent: ureq::Agent,
}

impl Fetcher {
    /// `timeout` bounds each HTTP request as a whole; `None` waits forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Fetcher {
            agent: builder.build(),
        }
    }

    pub fn open(&self, access: &AccessUrl) -> Result<Box<dyn Read + Send>> {
        let url = Url::parse(access.url.trim())?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| Error::InvalidUrl(format!("not a local file URL: {}", url)))?;
                Ok(Box::new(File::open(path)?))
            }
            "http" | "https" => {
                let mut req = self.agent.get(url.as_str());
                for (name, value) in access.header_pairs() {
                    req = req.set(name, value);
                }
                let response = req.call()?;
                Ok(Box::new(response.into_reader()))
            }
            other => Err(Error::InvalidUrl(format!(
                "unsupported access URL scheme: {}",
                other
            ))),
        }
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Fetcher::new(None)
    }
}
