use appforge_agent::ProjectManager;

#[derive(Clone, Debug)]
pub struct AppState {
    pub manager: ProjectManager,
    /// Client for preview forwarding. Redirects are relayed, never followed.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(manager: ProjectManager) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build preview client, using defaults");
                reqwest::Client::new()
            });
        Self { manager, http }
    }
}
