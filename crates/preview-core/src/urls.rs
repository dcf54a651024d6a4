//! Public URLs of the permanent site and of preview slots.

use anyhow::Context;
use url::Url;

use crate::types::RequestId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentUrls {
    base: Url,
    container: String,
}

impl DeploymentUrls {
    /// Build from hosting coordinates, yielding `https://<owner>.<host>/<site>`.
    ///
    /// `container` is the branch directory holding the slots; the branch
    /// root is served at the site path.
    pub fn new(owner: &str, host: &str, site: &str, container: &str) -> anyhow::Result<Self> {
        let owner = owner.trim().to_lowercase();
        let host = host.trim().trim_matches('.');
        let site = site.trim().trim_matches('/');
        let container = container.trim().trim_matches('/');
        if owner.is_empty() || host.is_empty() || site.is_empty() || container.is_empty() {
            anyhow::bail!(
                "owner, host, site and container are all required to build deployment URLs"
            );
        }
        let raw = format!("https://{}.{}/{}/", owner, host, site);
        let base = Url::parse(&raw).with_context(|| format!("Invalid deployment URL: {}", raw))?;
        Ok(Self {
            base,
            container: container.to_string(),
        })
    }

    /// URL of the permanent deployment.
    pub fn production(&self) -> Url {
        let mut url = self.base.clone();
        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);
        url
    }

    /// URL of a request's preview: `<production>/<container>/<id>/`, the
    /// slot directory the publisher writes.
    pub fn preview(&self, request_id: RequestId) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}{}/", url.path(), request_id.slot_path(&self.container));
        url.set_path(&path);
        url
    }
}
