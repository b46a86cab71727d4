//! Event history and build log endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipyard_core::domain::event::EventRecord;
use shipyard_core::dto::workflow::EventQuery;
use uuid::Uuid;

impl OrchestratorClient {
    /// Retained bus events, oldest first
    pub async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let response = self
            .client
            .get(self.url("/events"))
            .query(query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Stream a build's CI log, calling `on_chunk` as text arrives
    pub async fn stream_build_logs(
        &self,
        build_id: Uuid,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<()> {
        let url = self.url(&format!("/builds/{}/logs", build_id));
        let mut response = self.check_status(self.client.get(&url).send().await?).await?;

        while let Some(chunk) = response.chunk().await? {
            on_chunk(&String::from_utf8_lossy(&chunk));
        }
        Ok(())
    }
}
