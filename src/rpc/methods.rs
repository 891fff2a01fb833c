//! Method table of the RPC surface.
//!
//! Every handler receives the credentials of the connected peer and passes
//! them to the operation, which does its own authorization.

use std::fs::File;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AppContext;
use crate::core::capability::CapabilityTable;
use crate::core::configuration::ConfigurationItem;
use crate::core::{BlockObject, Caller, DriveObject, ObjectGraph, ObjectPath, OpenMode};
use crate::db;
use crate::error::StorageError;
use crate::ops::{self, FormatOptions};

use super::protocol::{Request, Response};

/// A response, plus a descriptor to pass alongside it.
pub struct Reply {
    pub response: Response,
    pub fd: Option<File>,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self { response, fd: None }
    }
}

/// Published view of a drive or block object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub path: ObjectPath,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub sysfs_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive: Option<ObjectPath>,
    /// Other drives in the same enclosure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub siblings: Vec<ObjectPath>,
    pub capabilities: CapabilityTable,
    #[serde(skip_serializing_if = "CapabilityTable::is_empty")]
    pub module_capabilities: CapabilityTable,
}

impl ObjectSummary {
    fn of_drive(graph: &ObjectGraph, drive: &DriveObject) -> Self {
        Self {
            path: drive.path.clone(),
            kind: "drive",
            device: None,
            sysfs_path: drive.device().map(|d| d.sysfs_path.clone()),
            drive: None,
            siblings: graph.siblings(drive).into_iter().map(|d| d.path.clone()).collect(),
            capabilities: drive.capabilities.clone(),
            module_capabilities: drive.module_capabilities.clone(),
        }
    }

    fn of_block(graph: &ObjectGraph, block: &BlockObject) -> Self {
        Self {
            path: block.path.clone(),
            kind: "block",
            device: Some(block.device_name()),
            sysfs_path: Some(block.device.sysfs_path.clone()),
            drive: graph.drive_for_block(block).map(|d| d.path.clone()),
            siblings: Vec::new(),
            capabilities: block.capabilities.clone(),
            module_capabilities: block.module_capabilities.clone(),
        }
    }
}

#[derive(Deserialize)]
struct PathParams {
    path: ObjectPath,
}

#[derive(Deserialize)]
struct FormatParams {
    path: ObjectPath,
    #[serde(rename = "type")]
    fs_type: String,
    #[serde(default)]
    options: FormatOptions,
}

#[derive(Deserialize)]
struct OpenParams {
    path: ObjectPath,
    #[serde(default)]
    options: OpenOptions,
}

#[derive(Default, Deserialize)]
struct OpenOptions {
    #[serde(default)]
    writable: bool,
}

#[derive(Deserialize)]
struct ItemParams {
    path: ObjectPath,
    item: ConfigurationItem,
}

#[derive(Deserialize)]
struct UpdateItemParams {
    path: ObjectPath,
    old: ConfigurationItem,
    new: ConfigurationItem,
}

#[derive(Deserialize)]
struct JobIdParams {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JobListParams {
    limit: Option<u32>,
    offset: Option<u32>,
    status: Option<String>,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}

/// Unwraps the params or returns an invalid-params reply.
macro_rules! params {
    ($id:expr, $params:expr) => {
        match parse($params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params($id, e).into(),
        }
    };
}

pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request, caller: Caller) -> Reply {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await.into(),
            "objects.list" => self.objects_list(id).into(),
            "objects.get" => self.objects_get(id, params),
            "block.format" => self.block_format(id, params, caller).await,
            "block.rescan" => {
                let p: PathParams = params!(id, params);
                Response::from_result(id, ops::block::rescan(&self.ctx, &p.path, &caller).await)
                    .into()
            }
            "block.open_for_backup" => self.open(id, params, caller, |_| OpenMode::Backup).await,
            "block.open_for_restore" => self.open(id, params, caller, |_| OpenMode::Restore).await,
            "block.open_for_benchmark" => {
                self.open(id, params, caller, |writable| OpenMode::Benchmark { writable })
                    .await
            }
            "block.add_configuration_item" => {
                let p: ItemParams = params!(id, params);
                let result =
                    ops::block::add_configuration_item(&self.ctx, &p.path, &p.item, &caller).await;
                Response::from_result(id, result).into()
            }
            "block.remove_configuration_item" => {
                let p: ItemParams = params!(id, params);
                let result =
                    ops::block::remove_configuration_item(&self.ctx, &p.path, &p.item, &caller)
                        .await;
                Response::from_result(id, result).into()
            }
            "block.update_configuration_item" => {
                let p: UpdateItemParams = params!(id, params);
                let result = ops::block::update_configuration_item(
                    &self.ctx, &p.path, &p.old, &p.new, &caller,
                )
                .await;
                Response::from_result(id, result).into()
            }
            "block.get_secret_configuration" => {
                let p: PathParams = params!(id, params);
                let result =
                    ops::block::get_secret_configuration(&self.ctx, &p.path, &caller).await;
                Response::from_result(id, result).into()
            }
            "jobs.active" => Response::success(id, self.ctx.jobs.get_all().await).into(),
            "jobs.cancel" => self.jobs_cancel(id, params, caller).await,
            "jobs.list" => self.jobs_list(id, params).await,
            "jobs.get" => self.jobs_get(id, params).await,
            _ => Response::method_not_found(id, &request.method).into(),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
            drives: usize,
            blocks: usize,
            modules: Vec<&'static str>,
            socket_path: String,
            simulation: bool,
        }

        let (drives, blocks) = self
            .ctx
            .manager
            .read(|g| (g.drives().count(), g.blocks().count()));
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.start_time.elapsed().as_secs(),
                active_jobs: self.ctx.jobs.active_count().await,
                drives,
                blocks,
                modules: self.ctx.manager.module_names(),
                socket_path: self.ctx.config.socket_path.display().to_string(),
                simulation: self.ctx.config.simulation,
            },
        )
    }

    fn objects_list(&self, id: Value) -> Response {
        let objects: Vec<ObjectSummary> = self.ctx.manager.read(|g| {
            g.drives()
                .map(|d| ObjectSummary::of_drive(g, d))
                .chain(g.blocks().map(|b| ObjectSummary::of_block(g, b)))
                .collect()
        });
        Response::success(id, objects)
    }

    fn objects_get(&self, id: Value, params: Value) -> Reply {
        let p: PathParams = params!(id, params);
        let found = self.ctx.manager.read(|g| {
            g.drive(&p.path)
                .map(|d| ObjectSummary::of_drive(g, d))
                .or_else(|| g.block(&p.path).map(|b| ObjectSummary::of_block(g, b)))
        });
        match found {
            Some(object) => Response::success(id, object),
            None => Response::storage_error(
                id,
                &StorageError::NotFound(format!("No object at {}", p.path)),
            ),
        }
        .into()
    }

    async fn block_format(&self, id: Value, params: Value, caller: Caller) -> Reply {
        let p: FormatParams = params!(id, params);
        match ops::format(&self.ctx, &p.path, &p.fs_type, p.options, &caller).await {
            Ok(()) => Response::success(id, Value::Null),
            Err(e) => Response::format_error(id, &e),
        }
        .into()
    }

    async fn open(
        &self,
        id: Value,
        params: Value,
        caller: Caller,
        mode: impl FnOnce(bool) -> OpenMode,
    ) -> Reply {
        let p: OpenParams = params!(id, params);
        match ops::block::open_for(&self.ctx, &p.path, mode(p.options.writable), &caller).await {
            Ok(file) => Reply {
                response: Response::success(id, serde_json::json!({ "fd": 0 })),
                fd: Some(file),
            },
            Err(e) => Response::storage_error(id, &e).into(),
        }
    }

    /// Only root or the user who started a job may cancel it.
    async fn jobs_cancel(&self, id: Value, params: Value, caller: Caller) -> Reply {
        let p: JobIdParams = params!(id, params);
        let Some(job) = self.ctx.jobs.get(&p.id).await else {
            return Response::storage_error(
                id,
                &StorageError::NotFound(format!("No active job {}", p.id)),
            )
            .into();
        };
        if caller.uid != 0 && caller.uid != job.started_by {
            return Response::storage_error(
                id,
                &StorageError::Unauthorized(format!(
                    "job {} was started by another user",
                    p.id
                )),
            )
            .into();
        }
        Response::success(id, self.ctx.jobs.cancel(&p.id).await).into()
    }

    async fn jobs_list(&self, id: Value, params: Value) -> Reply {
        let p: JobListParams = if params.is_null() {
            JobListParams::default()
        } else {
            params!(id, params)
        };
        match db::jobs::list(
            &self.ctx.db,
            p.limit.unwrap_or(50),
            p.offset.unwrap_or(0),
            p.status,
        )
        .await
        {
            Ok(jobs) => Response::success(id, jobs),
            Err(e) => Response::storage_error(
                id,
                &StorageError::Failed(e.to_string()),
            ),
        }
        .into()
    }

    async fn jobs_get(&self, id: Value, params: Value) -> Reply {
        let p: JobIdParams = params!(id, params);
        match db::jobs::get_with_history(&self.ctx.db, p.id.clone()).await {
            Ok(job) => Response::success(id, job),
            Err(_) => Response::storage_error(
                id,
                &StorageError::NotFound(format!("No job {}", p.id)),
            ),
        }
        .into()
    }
}
