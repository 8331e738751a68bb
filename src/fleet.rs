use crate::config::Config;
use crate::error::ReduceError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Mutex;
use tracing::{debug, info};

const INSTALL_DIR: &str = "/opt/webreduce";
const WORKER_LOG: &str = "/tmp/webreduce-worker.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Open,
    Active,
    Cancelled,
    Failed,
    Closed,
}

impl RequestState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(RequestState::Open),
            "active" => Some(RequestState::Active),
            "cancelled" => Some(RequestState::Cancelled),
            "failed" => Some(RequestState::Failed),
            "closed" => Some(RequestState::Closed),
            _ => None,
        }
    }
}

/// One priced capacity request as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityRequest {
    pub id: String,
    pub state: RequestState,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub image_id: String,
    pub key_pair: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetRequest {
    pub desired_count: u32,
    pub price_limit: f64,
    pub instance: InstanceSpec,
    /// Startup script, already base64 encoded for the provider.
    pub bootstrap_payload: String,
}

pub trait FleetProviderLike: Send + Sync {
    /// Place one persistent request. Returns the provider's request ids.
    fn request_capacity(&self, request: &FleetRequest) -> Result<Vec<String>, ReduceError>;
    fn describe_requests(&self) -> Result<Vec<CapacityRequest>, ReduceError>;
    fn cancel_requests(&self, ids: &[String]) -> Result<(), ReduceError>;
    fn terminate_instances(&self, ids: &[String]) -> Result<(), ReduceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetStatus {
    pub active: usize,
    /// Open plus active requests.
    pub requested: usize,
}

impl FleetStatus {
    pub fn from_requests(requests: &[CapacityRequest]) -> Self {
        let mut status = FleetStatus::default();
        for request in requests {
            match request.state {
                RequestState::Active => {
                    status.active += 1;
                    status.requested += 1;
                }
                RequestState::Open => status.requested += 1,
                _ => {}
            }
        }
        status
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cancelled_requests: usize,
    pub terminated_instances: usize,
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Startup script for a fleet node: install a minimal runtime, fetch the worker artifact,
/// export the node's settings and start the worker in the background.
pub fn bootstrap_script(config: &Config) -> String {
    let binary = format!("{}/webreduce-worker", INSTALL_DIR);
    let mut script = String::from("#!/bin/bash\nset -e\n");
    script.push_str("apt-get update\n");
    script.push_str("apt-get -y install ca-certificates curl\n");
    script.push_str(&format!("mkdir -p {}\n", INSTALL_DIR));
    script.push_str(&format!(
        "curl -fsSL -o {} {}\n",
        binary,
        shell_quote(&config.artifact_url())
    ));
    script.push_str(&format!("chmod +x {}\n", binary));
    for (key, value) in config.node_environment() {
        script.push_str(&format!("export {}={}\n", key, shell_quote(&value)));
    }
    script.push_str(&format!("nohup {} > {} 2>&1 &\n", binary, WORKER_LOG));
    script
}

pub fn encode_payload(script: &str) -> String {
    STANDARD.encode(script.as_bytes())
}

pub struct FleetController<'a> {
    provider: &'a dyn FleetProviderLike,
}

impl<'a> FleetController<'a> {
    pub fn new(provider: &'a dyn FleetProviderLike) -> Self {
        Self { provider }
    }

    /// Request `count` more nodes. Every call adds an independent request.
    pub fn create(&self, config: &Config, count: u32, price_limit: f64) -> Result<Vec<String>, ReduceError> {
        if count == 0 {
            return Err(ReduceError::Fleet("instance count must be positive".into()));
        }
        let script = bootstrap_script(config);
        debug!(script = %script, "bootstrap script");
        let request = FleetRequest {
            desired_count: count,
            price_limit,
            instance: InstanceSpec {
                instance_type: config.instance_type.clone(),
                image_id: config.image_id.clone(),
                key_pair: Some(config.key_pair.clone()).filter(|k| !k.is_empty()),
            },
            bootstrap_payload: encode_payload(&script),
        };
        info!(
            count,
            instance_type = %request.instance.instance_type,
            price_limit,
            "requesting instances"
        );
        let ids = self.provider.request_capacity(&request)?;
        info!(requests = ids.len(), "request placed, use monitor to follow progress and shutdown to stop");
        Ok(ids)
    }

    /// Cancel every request, then terminate every instance that is currently active.
    pub fn shutdown(&self) -> Result<ShutdownReport, ReduceError> {
        let requests = self.provider.describe_requests()?;
        let request_ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
        let instance_ids: Vec<String> = requests
            .iter()
            .filter(|r| r.state == RequestState::Active)
            .filter_map(|r| r.instance_id.clone())
            .collect();

        if !request_ids.is_empty() {
            self.provider.cancel_requests(&request_ids)?;
            info!(requests = request_ids.len(), "cancelled capacity requests");
        }
        if !instance_ids.is_empty() {
            self.provider.terminate_instances(&instance_ids)?;
            info!(instances = instance_ids.len(), "shut down instances");
        }
        Ok(ShutdownReport {
            cancelled_requests: request_ids.len(),
            terminated_instances: instance_ids.len(),
        })
    }

    pub fn status(&self) -> Result<FleetStatus, ReduceError> {
        Ok(FleetStatus::from_requests(&self.provider.describe_requests()?))
    }
}

#[derive(Default)]
struct FleetState {
    requests: Vec<CapacityRequest>,
    placed: Vec<FleetRequest>,
    terminated: Vec<String>,
    next_id: u64,
}

/// In-process fleet provider. Requests start open; `activate` simulates fulfilment.
#[derive(Default)]
pub struct InMemoryFleet {
    state: Mutex<FleetState>,
    failing: Mutex<bool>,
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, count: usize) {
        let mut state = self.lock();
        let mut remaining = count;
        for request in state.requests.iter_mut() {
            if remaining == 0 {
                break;
            }
            if request.state == RequestState::Open {
                request.state = RequestState::Active;
                request.instance_id = Some(format!("i-{}", request.id.trim_start_matches("sir-")));
                remaining -= 1;
            }
        }
    }

    pub fn placed(&self) -> Vec<FleetRequest> {
        self.lock().placed.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = failing;
    }

    fn check(&self) -> Result<(), ReduceError> {
        if *self.failing.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ReduceError::Fleet("provider unavailable".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FleetProviderLike for InMemoryFleet {
    fn request_capacity(&self, request: &FleetRequest) -> Result<Vec<String>, ReduceError> {
        self.check()?;
        let mut state = self.lock();
        state.placed.push(request.clone());
        let mut ids = Vec::new();
        for _ in 0..request.desired_count {
            let id = format!("sir-{}", state.next_id);
            state.next_id += 1;
            state.requests.push(CapacityRequest {
                id: id.clone(),
                state: RequestState::Open,
                instance_id: None,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    fn describe_requests(&self) -> Result<Vec<CapacityRequest>, ReduceError> {
        self.check()?;
        Ok(self.lock().requests.clone())
    }

    fn cancel_requests(&self, ids: &[String]) -> Result<(), ReduceError> {
        self.check()?;
        for request in self.lock().requests.iter_mut() {
            if ids.contains(&request.id) {
                request.state = RequestState::Cancelled;
            }
        }
        Ok(())
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<(), ReduceError> {
        self.check()?;
        self.lock().terminated.extend(ids.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn test_bootstrap_script_fetches_artifact_and_exports_config() {
        let script = bootstrap_script(&test_config());
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("curl -fsSL -o /opt/webreduce/webreduce-worker 'https://deploy.s3.amazonaws.com/webreduce-worker'"));
        assert!(script.contains("export WEBREDUCE_QUEUE_NAME='jobs'\n"));
        assert!(script.trim_end().ends_with("&"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_payload_is_base64_of_script() {
        let encoded = encode_payload("#!/bin/bash\n");
        assert_eq!(STANDARD.decode(encoded).unwrap(), b"#!/bin/bash\n");
    }

    #[test]
    fn test_create_places_independent_requests() {
        let fleet = InMemoryFleet::new();
        let controller = FleetController::new(&fleet);
        let config = test_config();
        controller.create(&config, 2, 0.25).unwrap();
        controller.create(&config, 1, 0.25).unwrap();

        let placed = fleet.placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].desired_count, 2);
        assert_eq!(placed[0].instance.instance_type, "c5.xlarge");
        assert_eq!(controller.status().unwrap(), FleetStatus { active: 0, requested: 3 });
    }

    #[test]
    fn test_create_rejects_zero() {
        let fleet = InMemoryFleet::new();
        assert!(FleetController::new(&fleet).create(&test_config(), 0, 0.1).is_err());
    }

    #[test]
    fn test_shutdown_cancels_all_and_terminates_active() {
        let fleet = InMemoryFleet::new();
        let controller = FleetController::new(&fleet);
        controller.create(&test_config(), 3, 0.25).unwrap();
        fleet.activate(2);
        assert_eq!(controller.status().unwrap(), FleetStatus { active: 2, requested: 3 });

        let report = controller.shutdown().unwrap();
        assert_eq!(report, ShutdownReport { cancelled_requests: 3, terminated_instances: 2 });
        assert_eq!(fleet.terminated(), vec!["i-0".to_string(), "i-1".to_string()]);
        assert_eq!(controller.status().unwrap(), FleetStatus::default());
    }

    #[test]
    fn test_request_state_parse() {
        assert_eq!(RequestState::parse("active"), Some(RequestState::Active));
        assert_eq!(RequestState::parse("weird"), None);
    }
}
