//! Admission checker
//!
//! A conservative first-fit simulation run before anything is created.
//! It works on [`HostResourceRecord`] copies, so a rejected admission
//! leaves the catalog untouched.

use crate::models::{HostBrief, ResourceRequest, ServiceType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transient free-capacity ledger for one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResourceRecord {
    pub host_id: String,
    pub hostname: String,
    pub cpu_free: u64,
    pub mem_free: u64,
    pub medium_free: u64,
    pub high_free: u64,
    pub pod_free: u64,
    pub used_by: Vec<ServiceType>,
}

impl From<&HostBrief> for HostResourceRecord {
    fn from(host: &HostBrief) -> Self {
        Self {
            host_id: host.id.clone(),
            hostname: host.name.clone(),
            cpu_free: host.cpu_free,
            mem_free: host.memory_free,
            medium_free: host.medium_free,
            high_free: host.high_free,
            pod_free: host.pod_free,
            used_by: Vec::new(),
        }
    }
}

impl HostResourceRecord {
    fn fits(&self, request: &ResourceRequest) -> bool {
        self.cpu_free >= request.cpu_milli
            && self.mem_free >= request.memory_mib
            && self.pod_free >= 1
            && self.medium_free >= request.storage_medium_mib
            && self.high_free >= request.storage_high_mib
    }

    fn take(&mut self, request: &ResourceRequest) {
        self.cpu_free -= request.cpu_milli;
        self.mem_free -= request.memory_mib;
        self.medium_free -= request.storage_medium_mib;
        self.high_free -= request.storage_high_mib;
        self.pod_free -= 1;
        self.used_by.push(request.service_type);
    }
}

impl fmt::Display for HostResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(cpu={}m mem={}Mi medium={}Mi high={}Mi pods={})",
            self.hostname, self.cpu_free, self.mem_free, self.medium_free, self.high_free, self.pod_free
        )
    }
}

/// Summed capacity across requests or hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTotals {
    pub cpu_milli: u64,
    pub memory_mib: u64,
    pub medium_mib: u64,
    pub high_mib: u64,
}

impl fmt::Display for ResourceTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m mem={}Mi medium={}Mi high={}Mi",
            self.cpu_milli, self.memory_mib, self.medium_mib, self.high_mib
        )
    }
}

/// Why a set of requests was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("insufficient resources: requested {requested}, available {available}")]
    Aggregate {
        requested: ResourceTotals,
        available: ResourceTotals,
    },

    #[error("insufficient resources: no host fits {request}; hosts: {}", render(.hosts))]
    Unsatisfied {
        request: ResourceRequest,
        hosts: Vec<HostResourceRecord>,
    },

    #[error("insufficient resources on {}: growth cpu={cpu_milli}m mem={memory_mib}Mi", .host)]
    Growth {
        host: HostResourceRecord,
        cpu_milli: u64,
        memory_mib: u64,
    },
}

fn render(hosts: &[HostResourceRecord]) -> String {
    if hosts.is_empty() {
        return "none".to_string();
    }
    hosts
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One request placed on one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub request: ResourceRequest,
    pub host_id: String,
}

/// Outcome of a successful admission
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// In placement order (ascending by cpu, then memory)
    pub assignments: Vec<Assignment>,
    pub ledger: Vec<HostResourceRecord>,
}

/// Check that `requests` fit on `hosts`
pub fn admit(requests: &[ResourceRequest], hosts: &[HostBrief]) -> Result<Admission, AdmissionError> {
    run(requests, hosts, false)
}

/// Like [`admit`], but never places two units of the same service type on
/// one host
pub fn admit_spread(
    requests: &[ResourceRequest],
    hosts: &[HostBrief],
) -> Result<Admission, AdmissionError> {
    run(requests, hosts, true)
}

fn run(
    requests: &[ResourceRequest],
    hosts: &[HostBrief],
    spread: bool,
) -> Result<Admission, AdmissionError> {
    let mut ledger: Vec<HostResourceRecord> = hosts.iter().map(HostResourceRecord::from).collect();
    check_aggregate(requests, &ledger)?;

    let mut pending = requests.to_vec();
    pending.sort_by(|a, b| {
        a.cpu_milli
            .cmp(&b.cpu_milli)
            .then(a.memory_mib.cmp(&b.memory_mib))
    });

    let mut assignments = Vec::with_capacity(pending.len());
    for request in pending {
        ledger.sort_by(|a, b| {
            b.cpu_free
                .cmp(&a.cpu_free)
                .then(b.mem_free.cmp(&a.mem_free))
        });

        let slot = ledger.iter_mut().find(|host| {
            host.fits(&request) && !(spread && host.used_by.contains(&request.service_type))
        });
        match slot {
            Some(host) => {
                host.take(&request);
                assignments.push(Assignment {
                    host_id: host.host_id.clone(),
                    request,
                });
            }
            None => {
                return Err(AdmissionError::Unsatisfied {
                    request,
                    hosts: ledger,
                })
            }
        }
    }

    Ok(Admission {
        assignments,
        ledger,
    })
}

fn check_aggregate(
    requests: &[ResourceRequest],
    ledger: &[HostResourceRecord],
) -> Result<(), AdmissionError> {
    let requested = requests.iter().fold(ResourceTotals::default(), |mut t, r| {
        t.cpu_milli += r.cpu_milli;
        t.memory_mib += r.memory_mib;
        t.medium_mib += r.storage_medium_mib;
        t.high_mib += r.storage_high_mib;
        t
    });
    let available = ledger.iter().fold(ResourceTotals::default(), |mut t, h| {
        t.cpu_milli += h.cpu_free;
        t.memory_mib += h.mem_free;
        t.medium_mib += h.medium_free;
        t.high_mib += h.high_free;
        t
    });

    let short = requested.cpu_milli > available.cpu_milli
        || requested.memory_mib > available.memory_mib
        || (requested.medium_mib > 0 && requested.medium_mib > available.medium_mib)
        || (requested.high_mib > 0 && requested.high_mib > available.high_mib);
    if short {
        return Err(AdmissionError::Aggregate {
            requested,
            available,
        });
    }
    Ok(())
}

/// Check that a host can absorb additional cpu and memory
pub fn check_growth(host: &HostBrief, cpu_milli: u64, memory_mib: u64) -> Result<(), AdmissionError> {
    if host.cpu_free >= cpu_milli && host.memory_free >= memory_mib {
        return Ok(());
    }
    Err(AdmissionError::Growth {
        host: HostResourceRecord::from(host),
        cpu_milli,
        memory_mib,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str, cpu: u64, mem: u64, pods: u64) -> HostBrief {
        HostBrief {
            id: id.into(),
            name: id.into(),
            ip: format!("10.0.0.{}", id.len()),
            cluster_id: "c1".into(),
            cpu_free: cpu,
            memory_free: mem,
            medium_free: 0,
            high_free: 0,
            pod_free: pods,
            levels: vec![],
            remote_storages: vec![],
            unschedulable: false,
        }
    }

    fn request(cpu: u64, mem: u64) -> ResourceRequest {
        ResourceRequest {
            service_type: ServiceType::Mysql,
            cpu_milli: cpu,
            memory_mib: mem,
            storage_medium_mib: 0,
            storage_high_mib: 0,
            bandwidth: None,
        }
    }

    #[test]
    fn test_greedy_prefers_most_free_cpu() {
        let hosts = vec![host("big-cpu", 10, 20, 5), host("big-mem", 5, 50, 5)];

        let admission = admit(&[request(6, 10)], &hosts).unwrap();
        assert_eq!(admission.assignments[0].host_id, "big-cpu");

        let record = admission
            .ledger
            .iter()
            .find(|h| h.host_id == "big-cpu")
            .unwrap();
        assert_eq!(record.cpu_free, 4);
        assert_eq!(record.used_by, vec![ServiceType::Mysql]);
    }

    #[test]
    fn test_aggregate_shortfall_reports_totals() {
        let hosts = vec![host("h1", 4, 100, 5), host("h2", 4, 100, 5)];

        let err = admit(&[request(5, 10), request(5, 10)], &hosts).unwrap_err();
        match err {
            AdmissionError::Aggregate {
                requested,
                available,
            } => {
                assert_eq!(requested.cpu_milli, 10);
                assert_eq!(available.cpu_milli, 8);
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[test]
    fn test_no_pod_slot_is_unsatisfied() {
        let hosts = vec![host("h1", 100, 100, 0)];

        let err = admit(&[request(1, 1)], &hosts).unwrap_err();
        assert!(matches!(err, AdmissionError::Unsatisfied { .. }));
        assert!(err.to_string().contains("pods=0"));
    }

    #[test]
    fn test_fragmented_capacity_fails_per_request() {
        // 6 cpu in total, but no single host has 4
        let hosts = vec![host("h1", 3, 100, 5), host("h2", 3, 100, 5)];

        let err = admit(&[request(4, 1)], &hosts).unwrap_err();
        assert!(matches!(err, AdmissionError::Unsatisfied { .. }));
    }

    #[test]
    fn test_requests_are_placed_smallest_first() {
        let hosts = vec![host("h1", 10, 100, 5), host("h2", 8, 100, 5)];

        let admission = admit(&[request(5, 1), request(2, 1)], &hosts).unwrap();
        assert_eq!(admission.assignments[0].request.cpu_milli, 2);
        assert_eq!(admission.assignments[0].host_id, "h1");
        // h1 drops to 8, ties with h2 and stays first on the stable sort
        assert_eq!(admission.assignments[1].host_id, "h1");
    }

    #[test]
    fn test_spread_uses_distinct_hosts() {
        let hosts = vec![host("h1", 10, 100, 5), host("h2", 8, 100, 5)];

        let admission = admit_spread(&[request(1, 1), request(1, 1)], &hosts).unwrap();
        assert_ne!(
            admission.assignments[0].host_id,
            admission.assignments[1].host_id
        );
    }

    #[test]
    fn test_growth_check() {
        let h = host("h1", 1000, 2048, 5);
        assert!(check_growth(&h, 500, 1024).is_ok());
        assert!(matches!(
            check_growth(&h, 1500, 0),
            Err(AdmissionError::Growth { .. })
        ));
    }
}
