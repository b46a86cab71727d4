//! Workflow-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipyard_core::domain::workflow::Workflow;
use shipyard_core::dto::workflow::{WorkflowDetails, WorkflowQuery};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Workflows
    // =============================================================================

    /// List workflows, newest first
    ///
    /// # Example
    /// ```no_run
    /// # use shipyard_client::OrchestratorClient;
    /// # use shipyard_core::domain::workflow::WorkflowStatus;
    /// # use shipyard_core::dto::workflow::WorkflowQuery;
    /// # async fn example() -> shipyard_client::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let failed = client.list_workflows(&WorkflowQuery {
    ///     status: Some(WorkflowStatus::Failed),
    ///     ..Default::default()
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn list_workflows(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>> {
        let response = self
            .client
            .get(self.url("/workflows"))
            .query(query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a workflow with its build and deployment
    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDetails> {
        let url = self.url(&format!("/workflows/{}", workflow_id));
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Cancel a pending or building workflow
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<Workflow> {
        let url = self.url(&format!("/workflows/{}/cancel", workflow_id));
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Roll a succeeded workflow back to the previous deployment
    pub async fn rollback_workflow(&self, workflow_id: Uuid) -> Result<Workflow> {
        let url = self.url(&format!("/workflows/{}/rollback", workflow_id));
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }
}
