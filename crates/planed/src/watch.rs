//! Job event source for the reconciliation controller

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use plane_lib::jobs::JobEvent;
use plane_lib::orchestrator::JobKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Jobs created by the engine carry this label
pub const JOB_LABEL: &str = "dbplane/kind";

fn key(job: &Job, namespace: &str) -> JobKey {
    JobKey::new(
        job.namespace().unwrap_or_else(|| namespace.to_string()),
        job.name_any(),
    )
}

/// Translate one watcher event into controller events
pub fn events(event: watcher::Event<Job>, namespace: &str) -> Vec<JobEvent> {
    match event {
        watcher::Event::Applied(job) => vec![JobEvent::Updated(key(&job, namespace))],
        watcher::Event::Deleted(job) => vec![JobEvent::Deleted(key(&job, namespace))],
        watcher::Event::Restarted(jobs) => jobs
            .iter()
            .map(|job| JobEvent::Added(key(job, namespace)))
            .collect(),
    }
}

/// Stream job events into `sender` until `shutdown` fires or the receiver closes
pub async fn run(
    client: Client,
    namespace: String,
    sender: mpsc::Sender<JobEvent>,
    shutdown: CancellationToken,
) {
    let api: Api<Job> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().labels(JOB_LABEL);
    let mut stream = watcher(api, config).default_backoff().boxed();
    info!(namespace = %namespace, "Job watcher started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for event in events(event, &namespace) {
                        if sender.send(event).await.is_err() {
                            info!("Job event receiver closed");
                            return;
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Job watch failed"),
                None => break,
            },
        }
    }

    info!("Job watcher stopped");
}
