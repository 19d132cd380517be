use std::sync::Arc;

use crate::proxy::GenerationService;
use crate::rate_limit::AdmissionController;

// app's shared state
pub struct AppState {
    pub service: GenerationService,
    pub admission: Arc<AdmissionController>, // shared with the sweeper task
    pub expose_error_details: bool,         // development only
}

impl AppState {
    pub fn new(
        service: GenerationService,
        admission: Arc<AdmissionController>,
        expose_error_details: bool,
    ) -> Self {
        Self {
            service,
            admission,
            expose_error_details,
        }
    }
}
