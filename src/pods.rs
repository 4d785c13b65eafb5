//! Pod watching: the reconciler behind the `watchpod` binary.

use std::{collections::BTreeMap, convert::Infallible, sync::Arc};

use k8s_openapi::api::core::v1::Pod;
use kube_client::{Api, Client};
use kube_runtime::watcher;
use parking_lot::Mutex;

use crate::{
    feed::{objects, objects::Objects, QualifiedName},
    logger::Logger,
    translator::Event,
    worker::Reconciler,
};

/// Watches pods in every namespace.
pub fn watch_pods(client: Client) -> Objects<Pod> {
    objects(Api::all(client), watcher::Config::default())
}

/// The fields of a pod the tracker acts upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub phase: Option<String>,
    pub node: Option<String>,
    pub ready: bool,
}

impl PodRecord {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        Self {
            phase: status.and_then(|status| status.phase.clone()),
            node: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
            ready: status
                .and_then(|status| status.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
                }),
        }
    }
}

/// Keeps a ledger of the observed state of every pod, logging each transition once.
pub struct PodTracker {
    ledger: Mutex<BTreeMap<QualifiedName, PodRecord>>,
    logger: Arc<dyn Logger>,
}

impl PodTracker {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            ledger: Mutex::new(BTreeMap::new()),
            logger,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<QualifiedName, PodRecord> {
        self.ledger.lock().clone()
    }

    fn sync(&self, event: &Event, pod: Option<&Pod>) {
        let key = event.key();
        let mut ledger = self.ledger.lock();
        match pod.map(PodRecord::from_pod) {
            Some(record) => {
                if ledger.get(key) == Some(&record) {
                    return;
                }
                self.logger.info(format_args!(
                    "Processed 1 event of type [{}] for object [{}]:[{}]: phase={} node={} ready={}",
                    event.kind(),
                    key.namespace.as_deref().unwrap_or(""),
                    key.name,
                    record.phase.as_deref().unwrap_or("Unknown"),
                    record.node.as_deref().unwrap_or("<none>"),
                    record.ready,
                ));
                ledger.insert(key.clone(), record);
            }
            None => {
                if ledger.remove(key).is_some() {
                    self.logger.info(format_args!(
                        "Processed 1 event of type [{}] for object [{}]:[{}]: gone",
                        event.kind(),
                        key.namespace.as_deref().unwrap_or(""),
                        key.name,
                    ));
                }
            }
        }
    }
}

impl Reconciler<Pod> for PodTracker {
    type Error = Infallible;

    async fn reconcile(&self, event: &Event, object: Option<Arc<Pod>>) -> Result<(), Infallible> {
        self.sync(event, object.as_deref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::{logger::recording::Recording, translator::EventKind};

    fn pod(phase: &str, ready: bool) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_owned()),
                name: Some("web".to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_owned()),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_owned()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_owned(),
                    status: if ready { "True" } else { "False" }.to_owned(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
        })
    }

    fn event(kind: EventKind) -> Event {
        Event::new(QualifiedName::new(Some("default"), "web"), kind)
    }

    #[tokio::test]
    async fn reconciling_unchanged_state_is_a_no_op() {
        let logger = Arc::new(Recording::default());
        let tracker = PodTracker::new(logger.clone());

        tracker
            .reconcile(&event(EventKind::Created), Some(pod("Running", true)))
            .await
            .unwrap();
        let after_first = tracker.snapshot();
        let lines_after_first = logger.lines().len();

        tracker
            .reconcile(&event(EventKind::Updated), Some(pod("Running", true)))
            .await
            .unwrap();

        assert_eq!(tracker.snapshot(), after_first);
        assert_eq!(logger.lines().len(), lines_after_first);
    }

    #[tokio::test]
    async fn follows_current_state_not_event_kind() {
        let tracker = PodTracker::new(Arc::new(crate::logger::Discard));
        let key = QualifiedName::new(Some("default"), "web");

        // a stale "delete" event for a pod that exists again is treated as a sync
        tracker
            .reconcile(&event(EventKind::Deleted), Some(pod("Pending", false)))
            .await
            .unwrap();
        assert_eq!(
            tracker.snapshot().get(&key).map(|record| record.ready),
            Some(false)
        );

        tracker.reconcile(&event(EventKind::Updated), None).await.unwrap();
        assert!(tracker.snapshot().is_empty());
    }
}
