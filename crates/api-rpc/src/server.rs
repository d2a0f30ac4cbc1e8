//! JSON-RPC Server
//!
//! Implements the JSON-RPC 2.0 server over TCP, bound to localhost.

use crate::handler::RpcHandler;
use crate::types::{
    BudgetStatusRequest, GetJobRequest, QueueStatsRequest, RecordUsageRequest, SetCeilingRequest,
};
use conveyor_core::application::EnqueueRequest;
use conveyor_core::error::{AppError, Result};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::RpcModule;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9640;

/// RPC Server Configuration
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub host: String,
    /// 0 picks a free port
    pub port: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, handler: RpcHandler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Start the JSON-RPC server
    ///
    /// Returns the bound address and the handle that stops the server.
    pub async fn start(self) -> Result<(SocketAddr, ServerHandle)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let server = Server::builder().build(&addr).await?;
        let local_addr = server.local_addr()?;

        let module = self.module()?;

        info!(addr = %local_addr, "JSON-RPC server started");

        Ok((local_addr, server.start(module)))
    }

    fn module(&self) -> Result<RpcModule<()>> {
        let mut module = RpcModule::new(());
        let register_error = |e: jsonrpsee::core::RegisterMethodError| {
            AppError::Internal(format!("Failed to register RPC method: {}", e))
        };

        let handler = self.handler.clone();
        module
            .register_async_method("jobs.enqueue.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: EnqueueRequest = params.parse()?;
                    handler.enqueue(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method("jobs.get.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: GetJobRequest = params.parse()?;
                    handler.get_job(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method("budget.status.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: BudgetStatusRequest = if params.is_object() {
                        params.parse()?
                    } else {
                        BudgetStatusRequest::default()
                    };
                    handler.budget_status(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method("budget.set_ceiling.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: SetCeilingRequest = params.parse()?;
                    handler.set_ceiling(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method("budget.record_usage.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: RecordUsageRequest = params.parse()?;
                    handler.record_usage(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method("queues.stats.v1", move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: QueueStatsRequest = if params.is_object() {
                        params.parse()?
                    } else {
                        QueueStatsRequest::default()
                    };
                    handler.queue_stats(req).await
                }
            })
            .map_err(register_error)?;

        Ok(module)
    }
}
