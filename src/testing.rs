//! In-memory fakes for unit tests.

use crate::crd::{
    Annotations, Cluster, ClusterSpec, ControlPlane, Machine, MachineDeployment, MachineSet,
    MachineSpec,
};
use crate::drain::{DrainClient, EvictOutcome};
use crate::error::{Error, Result};
use crate::refresh::{RefreshClient, RefreshStatus};
use crate::store::{ClusterStore, LabelQuery};
use crate::upgrade::events::{EventRecorder, EventType, UpgradeEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, EmptyDirVolumeSource, Node, NodeSpec, ObjectReference, Pod, PodSpec, Secret, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Bookkeeping {
    resource_version: u64,
    conflict_next_patch: bool,
    patched: Vec<String>,
}

impl Bookkeeping {
    fn put<K: Resource + Clone>(&mut self, map: &mut BTreeMap<Key, K>, mut obj: K) -> K {
        self.resource_version += 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(self.resource_version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", meta.name.clone().unwrap_or_default()));
        }
        map.insert(key_of(&obj), obj.clone());
        obj
    }

    fn patch<K: Resource + Clone>(
        &mut self,
        map: &mut BTreeMap<Key, K>,
        obj: &K,
        annotations: &Annotations,
    ) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        if std::mem::take(&mut self.conflict_next_patch) {
            return Err(Error::Conflict(name));
        }
        let current = map
            .get(&key_of(obj))
            .cloned()
            .ok_or_else(|| Error::NotFound(name.clone()))?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != current.meta().resource_version
        {
            return Err(Error::Conflict(name));
        }
        let mut updated = current;
        updated.meta_mut().annotations = Some(annotations.clone());
        self.patched.push(name);
        Ok(self.put(map, updated))
    }
}

#[derive(Default)]
struct StoreState {
    books: Bookkeeping,
    clusters: BTreeMap<Key, Cluster>,
    machines: BTreeMap<Key, Machine>,
    machine_sets: BTreeMap<Key, MachineSet>,
    deployments: BTreeMap<Key, MachineDeployment>,
    control_planes: BTreeMap<Key, ControlPlane>,
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
}

/// `ClusterStore` over plain maps, with resource versions and uids assigned on write.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_cluster(&self, cluster: Cluster) -> Cluster {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.clusters, cluster)
    }

    pub fn insert_machine(&self, machine: Machine) -> Machine {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.machines, machine)
    }

    pub fn insert_machine_set(&self, machine_set: MachineSet) -> MachineSet {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.machine_sets, machine_set)
    }

    pub fn insert_machine_deployment(&self, md: MachineDeployment) -> MachineDeployment {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.deployments, md)
    }

    pub fn insert_control_plane(&self, cp: ControlPlane) -> ControlPlane {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.control_planes, cp)
    }

    pub fn insert_config_map(&self, cm: ConfigMap) -> ConfigMap {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.config_maps, cm)
    }

    pub fn insert_secret(&self, secret: Secret) -> Secret {
        let state = &mut *self.state.lock().unwrap();
        state.books.put(&mut state.secrets, secret)
    }

    pub fn remove_machine(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .machines
            .remove(&key(namespace, name));
    }

    pub fn machine(&self, namespace: &str, name: &str) -> Option<Machine> {
        self.state
            .lock()
            .unwrap()
            .machines
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn machine_annotations(&self, namespace: &str, name: &str) -> Annotations {
        self.machine(namespace, name)
            .and_then(|m| m.metadata.annotations)
            .unwrap_or_default()
    }

    pub fn machine_deployment(&self, namespace: &str, name: &str) -> Option<MachineDeployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn control_plane(&self, namespace: &str, name: &str) -> Option<ControlPlane> {
        self.state
            .lock()
            .unwrap()
            .control_planes
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
    }

    /// Make the next annotation patch fail as if another writer got there first.
    pub fn conflict_next_patch(&self) {
        self.state.lock().unwrap().books.conflict_next_patch = true;
    }

    /// Names of objects whose annotations were patched, in order.
    pub fn patched(&self) -> Vec<String> {
        self.state.lock().unwrap().books.patched.clone()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .clusters
            .get(&key(namespace, name))
            .cloned())
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        Ok(self.machine(namespace, name))
    }

    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>> {
        Ok(self.machine_deployment(namespace, name))
    }

    async fn get_control_plane(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControlPlane>> {
        Ok(self.control_plane(namespace, name))
    }

    async fn list_machines(&self, namespace: &str, query: &LabelQuery) -> Result<Vec<Machine>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .machines
            .iter()
            .filter(|((ns, _), m)| ns == namespace && query.matches(m.metadata.labels.as_ref()))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn list_machine_sets(
        &self,
        namespace: &str,
        query: &LabelQuery,
    ) -> Result<Vec<MachineSet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .machine_sets
            .iter()
            .filter(|((ns, _), m)| ns == namespace && query.matches(m.metadata.labels.as_ref()))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn patch_machine(&self, machine: &Machine, annotations: &Annotations) -> Result<Machine> {
        let state = &mut *self.state.lock().unwrap();
        state.books.patch(&mut state.machines, machine, annotations)
    }

    async fn patch_machine_deployment(
        &self,
        deployment: &MachineDeployment,
        annotations: &Annotations,
    ) -> Result<MachineDeployment> {
        let state = &mut *self.state.lock().unwrap();
        state.books.patch(&mut state.deployments, deployment, annotations)
    }

    async fn patch_control_plane(
        &self,
        control_plane: &ControlPlane,
        annotations: &Annotations,
    ) -> Result<ControlPlane> {
        let state = &mut *self.state.lock().unwrap();
        state.books.patch(&mut state.control_planes, control_plane, annotations)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let state = &mut *self.state.lock().unwrap();
        if state.config_maps.contains_key(&key_of(config_map)) {
            return Err(Error::AlreadyExists(config_map.name_any()));
        }
        state.books.put(&mut state.config_maps, config_map.clone());
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .remove(&key(namespace, name))
            .is_some())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned())
    }
}

// ==================== Drain ====================

#[derive(Default)]
struct DrainState {
    nodes: BTreeMap<String, Node>,
    pods: Vec<(String, Pod)>,
    blocked: BTreeSet<String>,
    evicted: Vec<String>,
    deleted: Vec<(String, Option<u32>)>,
    finalizers_removed: Vec<String>,
    resource_version: u64,
    conflict_next_update: bool,
}

/// `DrainClient` whose pods vanish as soon as they are evicted or deleted.
///
/// Deleting a pod that still has finalizers only marks it terminating.
#[derive(Default)]
pub struct FakeDrainClient {
    state: Mutex<DrainState>,
}

impl FakeDrainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.resource_version += 1;
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(state.resource_version.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            ..Default::default()
        };
        state.nodes.insert(name.to_string(), node);
    }

    pub fn is_unschedulable(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    pub fn add_pod(&self, node: &str, pod: Pod) {
        self.state
            .lock()
            .unwrap()
            .pods
            .push((node.to_string(), pod));
    }

    /// Fail the next node update with `Error::Conflict`, as if someone else wrote first.
    pub fn conflict_next_update(&self) {
        self.state.lock().unwrap().conflict_next_update = true;
    }

    pub fn block_eviction(&self, pod: &str) {
        self.state.lock().unwrap().blocked.insert(pod.to_string());
    }

    pub fn pods_on(&self, node: &str) -> Vec<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn evicted(&self) -> Vec<String> {
        self.state.lock().unwrap().evicted.clone()
    }

    pub fn deleted(&self) -> Vec<(String, Option<u32>)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn finalizers_removed(&self) -> Vec<String> {
        self.state.lock().unwrap().finalizers_removed.clone()
    }
}

#[async_trait]
impl DrainClient for FakeDrainClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state.lock().unwrap().nodes.get(name).cloned())
    }

    async fn set_node_unschedulable(&self, node: &Node, unschedulable: bool) -> Result<Node> {
        let mut state = self.state.lock().unwrap();
        let name = node.name_any();
        let current = state
            .nodes
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.clone()))?;
        if std::mem::take(&mut state.conflict_next_update)
            || current.metadata.resource_version != node.metadata.resource_version
        {
            return Err(Error::Conflict(name));
        }
        state.resource_version += 1;
        let mut updated = current;
        updated.metadata.resource_version = Some(state.resource_version.to_string());
        updated.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        state.nodes.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        Ok(self.pods_on(node))
    }

    async fn evict_pod(&self, pod: &Pod, _grace: Option<u32>) -> Result<EvictOutcome> {
        let mut state = self.state.lock().unwrap();
        let name = pod.name_any();
        if state.blocked.contains(&name) {
            return Ok(EvictOutcome::Blocked);
        }
        let before = state.pods.len();
        state.pods.retain(|(_, p)| p.name_any() != name);
        if state.pods.len() == before {
            return Ok(EvictOutcome::NotFound);
        }
        state.evicted.push(name);
        Ok(EvictOutcome::Evicted)
    }

    async fn delete_pod(&self, pod: &Pod, grace: Option<u32>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let name = pod.name_any();
        state.deleted.push((name.clone(), grace));
        let Some(idx) = state.pods.iter().position(|(_, p)| p.name_any() == name) else {
            return Ok(false);
        };
        let has_finalizers = state.pods[idx]
            .1
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if !has_finalizers {
            state.pods.remove(idx);
        }
        Ok(true)
    }

    async fn remove_pod_finalizers(&self, pod: &Pod) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = pod.name_any();
        state.finalizers_removed.push(name.clone());
        if let Some((_, stored)) = state.pods.iter_mut().find(|(_, p)| p.name_any() == name) {
            stored.metadata.finalizers = None;
        }
        Ok(())
    }
}

/// Pod in `namespace`, controlled by an owner of kind `owner_kind` if given.
pub fn pod(namespace: &str, name: &str, owner_kind: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner_kind.map(|kind| {
                vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: kind.to_string(),
                    name: format!("{}-owner", name),
                    uid: format!("uid-{}-owner", name),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        ..Default::default()
    }
}

pub fn add_emptydir_volume(pod: &mut Pod) {
    pod.spec
        .get_or_insert_with(Default::default)
        .volumes
        .get_or_insert_with(Vec::new)
        .push(Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
}

// ==================== Refresh ====================

#[derive(Default)]
struct RefreshState {
    start_results: VecDeque<Result<String>>,
    status_results: VecDeque<Result<RefreshStatus>>,
    started: Vec<(String, String)>,
    polled: Vec<(String, String)>,
}

/// `RefreshClient` replaying queued answers. An empty queue is an unreachable node.
#[derive(Default)]
pub struct FakeRefreshClient {
    state: Mutex<RefreshState>,
}

impl FakeRefreshClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(&self, result: Result<String>) {
        self.state.lock().unwrap().start_results.push_back(result);
    }

    pub fn on_status(&self, result: Result<RefreshStatus>) {
        self.state.lock().unwrap().status_results.push_back(result);
    }

    /// `(machine, target)` of every start call.
    pub fn started(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().started.clone()
    }

    /// `(machine, change id)` of every status call.
    pub fn polled(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().polled.clone()
    }
}

#[async_trait]
impl RefreshClient for FakeRefreshClient {
    async fn start_refresh(&self, machine: &Machine, target: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state
            .started
            .push((machine.name_any(), target.to_string()));
        state
            .start_results
            .pop_front()
            .unwrap_or_else(|| Err(Error::Refresh("node unreachable".to_string())))
    }

    async fn refresh_status(&self, machine: &Machine, change_id: &str) -> Result<RefreshStatus> {
        let mut state = self.state.lock().unwrap();
        state
            .polled
            .push((machine.name_any(), change_id.to_string()));
        state
            .status_results
            .pop_front()
            .unwrap_or_else(|| Err(Error::Refresh("node unreachable".to_string())))
    }
}

pub fn refresh_status(completed: bool, status: &str, error_message: &str) -> RefreshStatus {
    RefreshStatus {
        completed,
        status: status.to_string(),
        error_message: error_message.to_string(),
    }
}

// ==================== Events ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: &'static str,
    pub note: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn publish(&self, object: &ObjectReference, event: UpgradeEvent) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: object.name.clone().unwrap_or_default(),
            type_: event.type_,
            reason: event.reason,
            note: event.note,
        });
    }
}

// ==================== Fixtures ====================

pub const NAMESPACE: &str = "default";

pub fn cluster(name: &str) -> Cluster {
    let mut cluster = Cluster::new(name, ClusterSpec::default());
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some(format!("uid-{}", name));
    cluster
}

/// Machine in `cluster` with the given uid and annotations.
pub fn machine(cluster: &str, name: &str, uid: &str, annotations: &[(&str, &str)]) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: cluster.to_string(),
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine.metadata.uid = Some(uid.to_string());
    machine.metadata.labels = Some(
        [(
            crate::crd::CLUSTER_NAME_LABEL.to_string(),
            cluster.to_string(),
        )]
        .into(),
    );
    machine.metadata.annotations = Some(annotations_from(annotations));
    machine
}

pub fn annotations_from(pairs: &[(&str, &str)]) -> Annotations {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    }
}
