/// Recorder setup failures.
#[cfg(feature = "prometheus")]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

/// Setup cannot fail when no exporter is compiled in.
#[cfg(not(feature = "prometheus"))]
pub type Error = std::convert::Infallible;

pub type Result<T> = std::result::Result<T, Error>;
