use std::fmt;

#[derive(Debug)]
pub enum ReduceError {
    Queue(String),
    Storage(String),
    AttributeStore(String),
    Fleet(String),
    Extraction(String),
    Config(String),
    Cancelled(String),
    Io(std::io::Error),
    Csv(csv::Error),
    Other(String),
}

impl ReduceError {
    /// Short class name recorded as the `exception` attribute of error stats.
    pub fn kind(&self) -> &'static str {
        match self {
            ReduceError::Queue(_) => "QueueError",
            ReduceError::Storage(_) => "StorageError",
            ReduceError::AttributeStore(_) => "AttributeStoreError",
            ReduceError::Fleet(_) => "FleetError",
            ReduceError::Extraction(_) => "ExtractionError",
            ReduceError::Config(_) => "ConfigError",
            ReduceError::Cancelled(_) => "Cancelled",
            ReduceError::Io(_) => "IoError",
            ReduceError::Csv(_) => "CsvError",
            ReduceError::Other(_) => "Error",
        }
    }
}

impl fmt::Display for ReduceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceError::Queue(e) => write!(f, "Queue error: {}", e),
            ReduceError::Storage(e) => write!(f, "Storage error: {}", e),
            ReduceError::AttributeStore(e) => write!(f, "Attribute store error: {}", e),
            ReduceError::Fleet(e) => write!(f, "Fleet error: {}", e),
            ReduceError::Extraction(e) => write!(f, "Extraction error: {}", e),
            ReduceError::Config(e) => write!(f, "Config error: {}", e),
            ReduceError::Cancelled(e) => write!(f, "Cancelled: {}", e),
            ReduceError::Io(e) => write!(f, "IO error: {}", e),
            ReduceError::Csv(e) => write!(f, "CSV error: {}", e),
            ReduceError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for ReduceError {}

impl From<std::io::Error> for ReduceError {
    fn from(err: std::io::Error) -> Self {
        ReduceError::Io(err)
    }
}

impl From<csv::Error> for ReduceError {
    fn from(err: csv::Error) -> Self {
        ReduceError::Csv(err)
    }
}

impl From<String> for ReduceError {
    fn from(err: String) -> Self {
        ReduceError::Other(err)
    }
}

impl From<&str> for ReduceError {
    fn from(err: &str) -> Self {
        ReduceError::Other(err.to_string())
    }
}
