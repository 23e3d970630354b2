//! Per state handlers of transfer and delete jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::container_specs::{BlobReference, RawManifest, ACCEPTED_MANIFEST_TYPES};
use crate::error::{Error, Result};
use crate::model::{JobStatus, Operation};
use crate::registry::{BlobStore, ManifestStore};

use super::actions::{ensure_present, size_to_string, ActionsTaken};
use super::logger::JobLogger;
use super::state_machine::{DesiredState, Handler, Transition};

/// A manifest pulled for the current tag, waiting for its blobs.
#[derive(Debug, Clone)]
pub struct PendingManifest {
    pub tag: String,
    pub manifest: RawManifest,
    /// Children of an index, pushed by digest before the index itself.
    pub children: Vec<RawManifest>,
}

/// Working state of one job, owned by the worker running it.
pub struct ReplicationContext {
    pub operation: Operation,
    pub source: Arc<dyn Adapter>,
    pub destination: Arc<dyn Adapter>,
    pub source_repository: String,
    pub dest_repository: String,
    /// Tags still to go, the head is the one in flight.
    pub tags: VecDeque<String>,
    pub override_existing: bool,
    pub manifest: Option<PendingManifest>,
    pub blobs: Vec<BlobReference>,
    /// Digests known to exist on the destination, shared by all tags of the job.
    pub blobs_existence: HashMap<String, bool>,
    pub actions: ActionsTaken,
    pub logger: JobLogger,
    pub desired: DesiredState,
}

pub(crate) type TransferContext = ReplicationContext;

impl ReplicationContext {
    fn source_ref(&self, tag: &str) -> String {
        format!("{}:{}", self.source_repository, tag)
    }

    fn dest_ref(&self, tag: &str) -> String {
        format!("{}:{}", self.dest_repository, tag)
    }
}

pub struct Start;

#[async_trait::async_trait]
impl Handler<ReplicationContext> for Start {
    async fn enter(&self, ctx: &mut ReplicationContext) -> Result<Transition> {
        let tags: Vec<&str> = ctx.tags.iter().map(|e| e.as_str()).collect();
        match ctx.operation {
            Operation::Transfer => {
                ctx.logger
                    .info(format!(
                        "replicating {} to {} at {}, tags: [{}]",
                        ctx.source_repository,
                        ctx.dest_repository,
                        ctx.destination.registry().registry_uri(),
                        tags.join(", ")
                    ))
                    .await
            }
            Operation::Delete => {
                ctx.logger
                    .info(format!(
                        "deleting from {} at {}, tags: [{}]",
                        ctx.dest_repository,
                        ctx.destination.registry().registry_uri(),
                        tags.join(", ")
                    ))
                    .await
            }
        }
        Ok(Transition::Continue)
    }
}

/// Makes sure the destination namespace exists and can be pushed to.
pub struct Check;

#[async_trait::async_trait]
impl Handler<ReplicationContext> for Check {
    async fn enter(&self, ctx: &mut ReplicationContext) -> Result<Transition> {
        ctx.destination
            .info()
            .check_repository(&ctx.dest_repository)?;
        ctx.destination
            .ensure_namespace(&ctx.dest_repository)
            .await?;
        ctx.logger
            .info(format!("destination {} is writable", ctx.dest_repository))
            .await;
        Ok(Transition::Continue)
    }
}

pub struct PullManifest;

impl PullManifest {
    /// Blobs of `candidates` the destination does not have yet.
    async fn missing_blobs(
        ctx: &mut ReplicationContext,
        candidates: Vec<BlobReference>,
    ) -> Result<Vec<BlobReference>> {
        let mut missing = Vec::new();
        for blob in candidates {
            if ctx.blobs_existence.get(&blob.digest).copied().unwrap_or(false) {
                continue;
            }
            if ctx
                .destination
                .registry()
                .blob_exist(&ctx.dest_repository, &blob.digest)
                .await?
            {
                ctx.blobs_existence.insert(blob.digest.clone(), true);
                ctx.actions.merge(&ActionsTaken::already_present(&blob));
                continue;
            }
            ctx.blobs_existence.insert(blob.digest.clone(), false);
            missing.push(blob);
        }
        Ok(missing)
    }
}

#[async_trait::async_trait]
impl Handler<ReplicationContext> for PullManifest {
    async fn enter(&self, ctx: &mut ReplicationContext) -> Result<Transition> {
        loop {
            let tag = match ctx.tags.front() {
                Some(t) => t.clone(),
                None => {
                    if !ctx.actions.is_empty() {
                        ctx.logger.info(format!("done, {}", ctx.actions)).await;
                    }
                    return Ok(Transition::To(JobStatus::Finished));
                }
            };

            let manifest = ctx
                .source
                .registry()
                .pull_manifest(&ctx.source_repository, &tag, ACCEPTED_MANIFEST_TYPES)
                .await?;

            match ctx
                .destination
                .registry()
                .manifest_exist(&ctx.dest_repository, &tag)
                .await?
            {
                Some(existing) if existing == manifest.digest => {
                    ctx.logger
                        .info(format!(
                            "{} is up to date ({})",
                            ctx.dest_ref(&tag),
                            existing
                        ))
                        .await;
                    ctx.tags.pop_front();
                    continue;
                }
                Some(existing) if !ctx.override_existing => {
                    ctx.logger
                        .warn(format!(
                            "{} points at {} instead of {}, not overriding",
                            ctx.dest_ref(&tag),
                            existing,
                            manifest.digest
                        ))
                        .await;
                    ctx.tags.pop_front();
                    continue;
                }
                _ => {}
            }

            let parsed = manifest.parse()?;
            let mut children = Vec::new();
            let mut candidates: Vec<BlobReference> = Vec::new();
            if parsed.is_index() {
                for child in parsed.child_manifests() {
                    let raw = ctx
                        .source
                        .registry()
                        .pull_manifest(&ctx.source_repository, &child.digest, ACCEPTED_MANIFEST_TYPES)
                        .await?;
                    for blob in raw.parse()?.transferable_blobs() {
                        if !candidates.iter().any(|c| c.digest == blob.digest) {
                            candidates.push(blob.clone());
                        }
                    }
                    children.push(raw);
                }
            } else {
                candidates = parsed.transferable_blobs().into_iter().cloned().collect();
            }

            let total = candidates.len();
            let missing = Self::missing_blobs(ctx, candidates).await?;
            ctx.logger
                .info(format!(
                    "pulled manifest {} ({}), {} of {} blobs to transfer",
                    ctx.source_ref(&tag),
                    manifest.digest,
                    missing.len(),
                    total
                ))
                .await;
            ctx.blobs = missing;
            ctx.manifest = Some(PendingManifest {
                tag,
                manifest,
                children,
            });
            return Ok(Transition::To(JobStatus::TransferBlob));
        }
    }
}

pub struct TransferBlob;

#[async_trait::async_trait]
impl Handler<ReplicationContext> for TransferBlob {
    async fn enter(&self, ctx: &mut ReplicationContext) -> Result<Transition> {
        let blobs = std::mem::take(&mut ctx.blobs);
        let total = blobs.len();
        for (done, blob) in blobs.iter().enumerate() {
            if let Some(requested) = ctx.desired.peek() {
                ctx.logger
                    .info(format!(
                        "{} requested, {} of {} blobs left untransferred",
                        requested,
                        total - done,
                        total
                    ))
                    .await;
                return Ok(Transition::Continue);
            }
            if ctx.blobs_existence.get(&blob.digest).copied().unwrap_or(false) {
                continue;
            }
            let action = ensure_present(ctx, blob).await?;
            ctx.blobs_existence.insert(blob.digest.clone(), true);
            if action.is_mount() {
                ctx.logger
                    .info(format!("blob mounted from {}: {}", ctx.source_repository, blob.digest))
                    .await;
            } else {
                ctx.logger
                    .info(format!(
                        "blob pushed: {} ({})",
                        blob.digest,
                        size_to_string(blob.size)
                    ))
                    .await;
            }
            ctx.actions.merge(&action);
        }
        Ok(Transition::Continue)
    }
}

pub struct PushManifest;

#[async_trait::async_trait]
impl Handler<ReplicationContext> for PushManifest {
    async fn enter(&self, ctx: &mut ReplicationContext) -> Result<Transition> {
        let pending = ctx
            .manifest
            .take()
            .ok_or_else(|| Error::Internal("no manifest was pulled before pushing".to_string()))?;

        let still_there = ctx
            .source
            .registry()
            .manifest_exist(&ctx.source_repository, &pending.tag)
            .await?;
        if still_there.is_none() {
            ctx.logger
                .warn(format!(
                    "manifest no longer exists on source: {}",
                    ctx.source_ref(&pending.tag)
                ))
                .await;
        } else {
            let registry = ctx.destination.registry();
            for child in pending.children.iter() {
                registry
                    .push_manifest(
                        &ctx.dest_repository,
                        &child.digest,
                        &child.media_type,
                        child.payload.clone(),
                    )
                    .await?;
            }
            let digest = registry
                .push_manifest(
                    &ctx.dest_repository,
                    &pending.tag,
                    &pending.manifest.media_type,
                    pending.manifest.payload.clone(),
                )
                .await?;
            ctx.logger
                .info(format!(
                    "manifest pushed: {} ({})",
                    ctx.dest_ref(&pending.tag),
                    digest
                ))
                .await;
        }

        ctx.tags.pop_front();
        ctx.blobs.clear();
        Ok(Transition::Continue)
    }
}

/// Deletes the job's tags from the destination, all of them when none were given.
pub struct Delete;

#[async_trait::async_trait]
impl Handler<ReplicationContext> for Delete {
    async fn enter(&self, ctx: &mut ReplicationContext) -> Result<Transition> {
        let tags: Vec<String> = if ctx.tags.is_empty() {
            match ctx.destination.list_tags(&ctx.dest_repository).await {
                Ok(tags) => tags,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e),
            }
        } else {
            ctx.tags.drain(..).collect()
        };

        let total = tags.len();
        let mut failures: Vec<Error> = Vec::new();
        for tag in tags {
            match ctx.destination.delete_tag(&ctx.dest_repository, &tag).await {
                Ok(()) => {
                    ctx.logger
                        .info(format!("tag deleted: {}", ctx.dest_ref(&tag)))
                        .await
                }
                Err(e) if e.is_not_found() => {
                    ctx.logger
                        .info(format!("tag already absent: {}", ctx.dest_ref(&tag)))
                        .await
                }
                Err(e) => {
                    ctx.logger
                        .warn(format!("failed to delete {}: {}", ctx.dest_ref(&tag), e))
                        .await;
                    failures.push(e);
                }
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(Transition::Continue),
            Some(first) => {
                ctx.logger
                    .warn(format!("{} of {} tags could not be deleted", failed, total))
                    .await;
                Err(first)
            }
        }
    }
}
