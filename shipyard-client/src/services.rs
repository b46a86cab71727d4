//! Service-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipyard_core::dto::workflow::{TriggerOutcome, TriggerService};
use uuid::Uuid;

impl OrchestratorClient {
    /// Build and deploy a service at a commit.
    ///
    /// The outcome's `coalesced` flag is set when a workflow for the same
    /// commit was already active.
    pub async fn trigger_service(
        &self,
        service_id: Uuid,
        req: &TriggerService,
    ) -> Result<TriggerOutcome> {
        let url = self.url(&format!("/services/{}/trigger", service_id));
        let response = self.client.post(&url).json(req).send().await?;

        self.handle_response(response).await
    }
}
