//! Placement scheduler
//!
//! Filters narrow the catalog, the matcher builds ranked plans, and the
//! admission checker picks the first plan whose hosts can take the
//! requests.

mod admission;
mod filter;
mod matcher;

pub use admission::{
    admit, admit_spread, check_growth, Admission, AdmissionError, Assignment, HostResourceRecord,
    ResourceTotals,
};
pub use filter::{
    filter_clusters, filter_hosts, filter_networks, filter_remote_storages, HostsByCluster,
    TopologyMap,
};
pub use matcher::{match_plans, Candidates, MatchParams, Matches, Plan, DEFAULT_TOPOLOGY};

use crate::catalog::Catalog;
use crate::models::{Conditions, HostBrief, ResourceRequest, ServiceType, StorageSpec};
use crate::observability::PlaneMetrics;
use crate::{Error, Result};
use std::time::Instant;
use tracing::debug;

/// Placement request for the missing units of one group
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub group: String,
    pub service_type: ServiceType,
    pub image: String,
    pub replicas: u32,
    /// Per-replica request
    pub request: ResourceRequest,
    pub storage: Option<StorageSpec>,
    pub conditions: Conditions,
    /// Hosts that must not receive new units
    pub exclude_hosts: Vec<String>,
}

impl ScheduleRequest {
    /// One request per replica
    pub fn requests(&self) -> Vec<ResourceRequest> {
        vec![self.request.clone(); self.replicas as usize]
    }
}

/// A unit slot resolved to a host, cluster and network
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub host: HostBrief,
    pub cluster_id: String,
    pub site_id: String,
    pub network_id: Option<String>,
}

/// The plan chosen for a request, with one slot per replica
#[derive(Debug, Clone)]
pub struct Placement {
    pub plan: Plan,
    pub slots: Vec<Slot>,
}

#[derive(Clone)]
pub struct Scheduler {
    catalog: Catalog,
    metrics: PlaneMetrics,
}

impl Scheduler {
    pub fn new(catalog: Catalog, metrics: PlaneMetrics) -> Self {
        Self { catalog, metrics }
    }

    /// Run the filters and return ranked plans
    pub async fn search(&self, req: &ScheduleRequest) -> Result<Vec<Plan>> {
        let conditions = &req.conditions;
        let clusters =
            filter_clusters(self.catalog.clusters.as_ref(), &conditions.cluster, &req.image).await?;

        // Networks only take part in matching when bandwidth is requested
        // or a network condition is declared
        let networks = match filter_networks(self.catalog.networks.as_ref(), &conditions.network).await {
            Ok(networks) => networks,
            Err(e) if req.request.bandwidth.is_none() && !network_required(conditions) => {
                debug!(group = %req.group, error = %e, "Continuing without networks");
                TopologyMap::new()
            }
            Err(e) => return Err(e),
        };

        let mut hosts =
            filter_hosts(self.catalog.hosts.as_ref(), &conditions.host, req.replicas).await?;
        if !req.exclude_hosts.is_empty() {
            for group in hosts.values_mut() {
                group.retain(|h| !req.exclude_hosts.contains(&h.id));
            }
        }

        let storages = filter_remote_storages(
            self.catalog.storages.as_ref(),
            self.catalog.pools.as_ref(),
            &conditions.remote_storage,
            req.storage.as_ref(),
        )
        .await?;

        let candidates = Candidates {
            clusters,
            networks,
            hosts,
            storages,
        };
        let plans = match_plans(
            &candidates,
            MatchParams {
                replicas: req.replicas,
                bandwidth: req.request.bandwidth,
                storage: req.storage.as_ref(),
                conditions,
            },
        );
        debug!(group = %req.group, plans = plans.len(), "Search complete");
        Ok(plans)
    }

    /// Pick the first ranked plan that passes admission
    pub async fn schedule(&self, req: &ScheduleRequest) -> Result<Placement> {
        let plans = self.search(req).await?;
        if plans.is_empty() {
            return Err(Error::validation("no plan matched"));
        }

        let requests = req.requests();
        let spread = req.conditions.host.high_availability;
        let mut last_rejection = None;
        for plan in plans {
            let started = Instant::now();
            let hosts = plan.hosts();
            let outcome = if spread {
                admit_spread(&requests, &hosts)
            } else {
                admit(&requests, &hosts)
            };
            self.metrics
                .observe_admission_latency(started.elapsed().as_secs_f64());

            match outcome {
                Ok(admission) => return place(plan, &hosts, admission),
                Err(rejection) => {
                    debug!(group = %req.group, topology = %plan.topology, error = %rejection, "Plan rejected by admission");
                    last_rejection = Some(rejection);
                }
            }
        }

        self.metrics.inc_admission_rejections();
        match last_rejection {
            Some(rejection) => Err(rejection.into()),
            None => Err(Error::validation("no plan matched")),
        }
    }

    /// Aggregate admission across the hosts every request could land on
    pub fn preflight(&self, requests: &[ResourceRequest], hosts: &[HostBrief]) -> Result<Admission> {
        let started = Instant::now();
        let outcome = admit(requests, hosts);
        self.metrics
            .observe_admission_latency(started.elapsed().as_secs_f64());
        outcome.map_err(|e| {
            self.metrics.inc_admission_rejections();
            Error::from(e)
        })
    }
}

fn place(plan: Plan, hosts: &[HostBrief], admission: Admission) -> Result<Placement> {
    let mut slots = Vec::with_capacity(admission.assignments.len());
    for assignment in &admission.assignments {
        let host = hosts
            .iter()
            .find(|h| h.id == assignment.host_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("admitted unknown host {}", assignment.host_id)))?;
        let matches = plan
            .matches_for(&host.id)
            .ok_or_else(|| Error::Internal(format!("host {} is not in the plan", host.id)))?;
        slots.push(Slot {
            cluster_id: matches.cluster.id.clone(),
            site_id: matches.cluster.site_id.clone(),
            network_id: matches.network.as_ref().map(|n| n.id.clone()),
            host,
        });
    }
    Ok(Placement { plan, slots })
}

fn network_required(conditions: &Conditions) -> bool {
    conditions.network.high_availability || !conditions.network.candidates.is_empty()
}

#[cfg(test)]
mod tests;
