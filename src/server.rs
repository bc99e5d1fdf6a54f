// src/server.rs
//
// gRPC front of the agent: Transporter.Transfer -> Controller

use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::command::Command;
use crate::controller::Controller;
use crate::pb::dbagent::transporter_server::Transporter;
use crate::pb::dbagent::{Request as TransferRequest, Response as TransferResponse};

/// One controller per agent; requests queue on its lock
#[derive(Clone)]
pub struct TransporterSvc {
    controller: Arc<Mutex<Controller>>,
}

impl TransporterSvc {
    pub fn new(controller: Arc<Mutex<Controller>>) -> Self {
        Self { controller }
    }
}

#[tonic::async_trait]
impl Transporter for TransporterSvc {
    async fn transfer(
        &self,
        req: Request<TransferRequest>,
    ) -> Result<Response<TransferResponse>, Status> {
        let peer = req.remote_addr();
        let cmd = Command::try_from(req.into_inner()).map_err(|e| {
            error!("rejected request from {:?}: {:#}", peer, e);
            Status::invalid_argument(format!("{:#}", e))
        })?;
        let operation = cmd.operation;

        let mut controller = self.controller.lock().await;
        match controller.handle(cmd).await {
            Ok(outcome) => {
                info!("transfer success ({:?} -> {:?})", operation, outcome.state);
                Ok(Response::new(TransferResponse { success: true }))
            }
            Err(e) => {
                error!("{:?} failed: {}", operation, e);
                Err(e.into())
            }
        }
    }
}
