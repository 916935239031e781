use async_trait::async_trait;
use smu_core::{Command, Response};
use smu_ipc::RequestHandler;

use crate::handlers::Handler;

pub struct DaemonDispatcher {
    handler: Handler,
}

impl DaemonDispatcher {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl RequestHandler for DaemonDispatcher {
    async fn handle(&self, command: Command) -> Response {
        self.handler.handle(command).await
    }
}

impl From<Handler> for DaemonDispatcher {
    fn from(handler: Handler) -> Self {
        Self::new(handler)
    }
}
