//! Read-only cluster client contract consumed by the watchers, and its
//! kube-rs implementation.

use std::marker::PhantomData;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::core::NamespaceResourceScope;
use kube::Client;
use thiserror::Error;

use crate::kinds::WatchedKind;

/// Selector and resume point for a list or watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub resource_version: Option<String>,
    pub timeout_secs: Option<u32>,
    pub bookmarks: bool,
}

impl ListOptions {
    pub fn fields(selector: impl Into<String>) -> Self {
        Self { field_selector: Some(selector.into()), ..Self::default() }
    }

    pub fn labels(selector: impl Into<String>) -> Self {
        Self { label_selector: Some(selector.into()), ..Self::default() }
    }

    /// Human-readable selector for logs.
    pub fn describe(&self) -> String {
        match (&self.label_selector, &self.field_selector) {
            (Some(l), Some(f)) => format!("{l},{f}"),
            (Some(l), None) => l.clone(),
            (None, Some(f)) => f.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceList<K> {
    /// Collection version usable to resume watching.
    pub resource_version: Option<String>,
    pub items: Vec<K>,
}

#[derive(Debug, Clone)]
pub enum WatchItem<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Heartbeat carrying only a fresh resource version.
    Bookmark(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The requested resource version is too old to resume from.
    #[error("resource version expired: {0}")]
    Gone(String),
    #[error("api: {0}")]
    Api(String),
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 410 => ClientError::Gone(resp.message),
            other => ClientError::Api(other.to_string()),
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchItem<K>, ClientError>>;

#[async_trait::async_trait]
pub trait ResourceClient<K>: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> Result<ResourceList<K>, ClientError>;
    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>, ClientError>;
}

/// kube-rs backed client for one namespaced kind.
pub struct KubeClient<K> {
    api: Api<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeClient<K>
where
    K: WatchedKind + kube::Resource<Scope = NamespaceResourceScope>,
{
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), _kind: PhantomData }
    }
}

#[async_trait::async_trait]
impl<K: WatchedKind> ResourceClient<K> for KubeClient<K> {
    async fn list(&self, opts: &ListOptions) -> Result<ResourceList<K>, ClientError> {
        let mut lp = ListParams::default();
        lp.label_selector = opts.label_selector.clone();
        lp.field_selector = opts.field_selector.clone();
        lp.timeout = opts.timeout_secs;
        let list = self.api.list(&lp).await?;
        Ok(ResourceList { resource_version: list.metadata.resource_version, items: list.items })
    }

    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>, ClientError> {
        let mut wp = WatchParams::default();
        wp.label_selector = opts.label_selector.clone();
        wp.field_selector = opts.field_selector.clone();
        wp.timeout = opts.timeout_secs;
        wp.bookmarks = opts.bookmarks;
        let version = opts.resource_version.clone().unwrap_or_else(|| "0".to_string());
        let stream = self.api.watch(&wp, &version).await?;
        Ok(stream
            .map(|ev| match ev {
                Ok(WatchEvent::Added(o)) => Ok(WatchItem::Added(o)),
                Ok(WatchEvent::Modified(o)) => Ok(WatchItem::Modified(o)),
                Ok(WatchEvent::Deleted(o)) => Ok(WatchItem::Deleted(o)),
                Ok(WatchEvent::Bookmark(b)) => Ok(WatchItem::Bookmark(b.metadata.resource_version)),
                Ok(WatchEvent::Error(e)) if e.code == 410 => Err(ClientError::Gone(e.message)),
                Ok(WatchEvent::Error(e)) => Err(ClientError::Api(e.to_string())),
                Err(e) => Err(ClientError::from(e)),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_joins_selectors() {
        let mut o = ListOptions::fields("metadata.name=abc");
        assert_eq!(o.describe(), "metadata.name=abc");
        o.label_selector = Some("vigil.dev/resource-id=abc".into());
        assert_eq!(o.describe(), "vigil.dev/resource-id=abc,metadata.name=abc");
    }
}
