use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("device api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("device api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("device api error {code}: {message}")]
    Api { code: String, message: String },
    #[error("device {0} not found in account")]
    DeviceNotFound(String),
    #[error("unexpected device api response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("meter request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("meter returned status {0}")]
    Status(u16),
    #[error("meter response has no numeric StatusSNS.E320.Power_in")]
    MissingField,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("bus client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed credentials unavailable: {0}")]
    Credentials(#[from] ApiError),
    #[error("feed broker port {0:?} is not a number")]
    Port(String),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Meter(#[from] MeterError),
}

impl ControlError {
    /// Fatal errors stop the process instead of a restart of the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Api(ApiError::DeviceNotFound(_)))
    }
}
