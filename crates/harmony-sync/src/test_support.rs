//! Test doubles shared by the sync tests: an in-memory backend, a syncable
//! test object, and an environment builder over the in-memory database.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;

use harmony_core::{
    hash_bytes, Account, AuthenticationError, ChangeToken, ConflictResolution,
    FetchError, File, FileError, LocalRecord, ManagedRecord, Metadata, RecordError, RecordID,
    RecordStatus, RemoteFile, RemoteRecord, ServiceError, Syncable, Version,
};
use harmony_db::{
    Database, DbConfig, DbError, DbResult, MemoryObjectStore, ObjectChanges, ObjectStore, Record,
    RecordController,
};

use crate::config::SyncConfig;
use crate::environment::SyncEnvironment;
use crate::service::{DownloadedRecord, RecordUpload, RemoteChanges, Service};

// =============================================================================
// Mock Service
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum MockCall {
    Authenticate,
    FetchAll,
    FetchChanged,
    UploadRecord,
    DownloadRecord,
    DeleteRecord,
    UploadFile,
    DownloadFile,
    DeleteFile,
    UpdateMetadata,
    FetchVersions,
}

#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Service(ServiceError),
    Authentication(AuthenticationError),
    InvalidChangeToken,
}

impl Failure {
    fn record_error(self, record_id: &RecordID) -> RecordError {
        match self {
            Failure::Service(err) => RecordError::from_service(record_id.clone(), err),
            Failure::Authentication(err) => RecordError::new(record_id.clone(), err),
            Failure::InvalidChangeToken => RecordError::unknown(record_id.clone()),
        }
    }

    fn file_error(self, file_identifier: &str) -> FileError {
        match self {
            Failure::Service(err) => FileError::from_service(file_identifier, err),
            Failure::Authentication(source) => FileError::Authentication {
                file_identifier: file_identifier.to_string(),
                source,
            },
            Failure::InvalidChangeToken => FileError::UnknownFile(file_identifier.to_string()),
        }
    }

    fn fetch_error(self) -> FetchError {
        match self {
            Failure::Service(err) => FetchError::Service(err),
            Failure::Authentication(err) => FetchError::Authentication(err),
            Failure::InvalidChangeToken => FetchError::InvalidChangeToken,
        }
    }

    fn authentication_error(self) -> AuthenticationError {
        match self {
            Failure::Authentication(err) => err,
            other => AuthenticationError::Other(format!("{other:?}")),
        }
    }
}

struct StoredRecord {
    remote: RemoteRecord,
    object: Arc<dyn Syncable>,
    files: Vec<RemoteFile>,
    versions: Vec<Version>,
    /// Object of every stored version, by version identifier.
    history: HashMap<String, Arc<dyn Syncable>>,
    changed_at: u64,
}

#[derive(Default)]
struct MockState {
    records: HashMap<String, StoredRecord>,
    files: HashMap<String, Vec<u8>>,
    tombstones: Vec<(u64, String)>,
    seq: u64,
    failures: VecDeque<(MockCall, Failure)>,
    record_failures: HashMap<(MockCall, RecordID), Failure>,
    calls: HashMap<MockCall, usize>,
    metadata_updates: HashMap<String, Metadata>,
}

impl MockState {
    /// Counts the call and returns the failure scripted for it, if any.
    fn enter(&mut self, call: MockCall, record_id: Option<&RecordID>) -> Option<Failure> {
        *self.calls.entry(call).or_default() += 1;

        if let Some(record_id) = record_id {
            if let Some(failure) = self.record_failures.get(&(call, record_id.clone())) {
                return Some(failure.clone());
            }
        }

        let position = self.failures.iter().position(|(c, _)| *c == call)?;
        self.failures.remove(position).map(|(_, failure)| failure)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn token(&self) -> ChangeToken {
        ChangeToken(self.seq.to_be_bytes().to_vec())
    }

    /// Stores a new current version, keeping the older ones.
    fn store(
        &mut self,
        remote_identifier: String,
        remote: RemoteRecord,
        object: Arc<dyn Syncable>,
        files: Vec<RemoteFile>,
        changed_at: u64,
    ) {
        let (mut versions, mut history) = self
            .records
            .remove(&remote_identifier)
            .map(|stored| (stored.versions, stored.history))
            .unwrap_or_default();
        versions.push(remote.version.clone());
        history.insert(remote.version.identifier.clone(), Arc::clone(&object));

        self.records.insert(
            remote_identifier,
            StoredRecord {
                remote,
                object,
                files,
                versions,
                history,
                changed_at,
            },
        );
    }

    fn record_by_id(&self, record_id: &RecordID) -> Option<&StoredRecord> {
        self.records
            .values()
            .find(|stored| stored.remote.record_id == *record_id)
    }
}

/// In-memory backend with scriptable failures.
#[derive(Default)]
pub(crate) struct MockService {
    state: Mutex<MockState>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `call` with `failure`. Queued failures are consumed in
    /// order.
    pub fn fail_next(&self, call: MockCall, failure: Failure) {
        self.state().failures.push_back((call, failure));
    }

    /// Fails every `call` concerning `record_id`.
    pub fn fail_record(&self, call: MockCall, record_id: &RecordID, failure: Failure) {
        self.state()
            .record_failures
            .insert((call, record_id.clone()), failure);
    }

    pub fn call_count(&self, call: MockCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Stores `object` as if another device had uploaded it.
    pub fn put_remote(&self, object: &TestObject) -> RemoteRecord {
        self.put_remote_as(object, &format!("remote-{}", object.id))
    }

    /// Stores `object` under the given backend identifier.
    pub fn put_remote_as(&self, object: &TestObject, remote_identifier: &str) -> RemoteRecord {
        let mut state = self.state();
        let seq = state.next_seq();
        let version = Version::new(format!("v{seq}"), Utc::now());

        let mut remote = RemoteRecord::new(remote_identifier, object.record_id(), version);
        remote.author = Some("Other Device".into());
        remote.content_hash = Some(object.content_hash());

        let mut files = Vec::new();
        for file in &object.files {
            let bytes = format!("{}:{}", file.identifier, seq).into_bytes();
            let remote_file = RemoteFile {
                identifier: file.identifier.clone(),
                remote_identifier: format!("file-{}-{}", object.id, file.identifier),
                version_identifier: format!("fv{seq}"),
                size: bytes.len() as i64,
                content_hash: hash_bytes(&bytes),
            };
            state
                .files
                .insert(remote_file.remote_identifier.clone(), bytes);
            files.push(remote_file);
        }

        state.store(
            remote_identifier.to_string(),
            remote.clone(),
            object.shared(),
            files,
            seq,
        );
        remote
    }

    /// Deletes a remote record as if another device had deleted it.
    pub fn remove_remote(&self, remote_identifier: &str) {
        let mut state = self.state();
        let seq = state.next_seq();
        state.records.remove(remote_identifier);
        state.tombstones.push((seq, remote_identifier.to_string()));
    }

    /// Change token for the current state.
    pub fn current_token(&self) -> ChangeToken {
        self.state().token()
    }

    pub fn remote(&self, record_id: &RecordID) -> Option<RemoteRecord> {
        self.state()
            .record_by_id(record_id)
            .map(|stored| stored.remote.clone())
    }

    pub fn remote_files(&self, record_id: &RecordID) -> Vec<RemoteFile> {
        self.state()
            .record_by_id(record_id)
            .map(|stored| stored.files.clone())
            .unwrap_or_default()
    }

    pub fn remote_count(&self) -> usize {
        self.state().records.len()
    }

    pub fn has_file(&self, remote_identifier: &str) -> bool {
        self.state().files.contains_key(remote_identifier)
    }

    pub fn metadata_update(&self, remote_identifier: &str) -> Option<Metadata> {
        self.state().metadata_updates.get(remote_identifier).cloned()
    }

    /// Marks the current version of a remote record as locked.
    pub fn lock(&self, record_id: &RecordID, previous_unlocked: Option<Version>) {
        let mut state = self.state();
        if let Some(stored) = state
            .records
            .values_mut()
            .find(|stored| stored.remote.record_id == *record_id)
        {
            stored.remote.is_locked = true;
            stored.remote.previous_unlocked_version = previous_unlocked;
        }
    }
}

#[async_trait]
impl Service for MockService {
    fn identifier(&self) -> &str {
        "com.harmony.mock"
    }

    fn localized_name(&self) -> &str {
        "Mock"
    }

    async fn authenticate(&self) -> Result<Account, AuthenticationError> {
        self.authenticate_in_background().await
    }

    async fn authenticate_in_background(&self) -> Result<Account, AuthenticationError> {
        match self.state().enter(MockCall::Authenticate, None) {
            Some(failure) => Err(failure.authentication_error()),
            None => Ok(Account::new("Tester")),
        }
    }

    async fn deauthenticate(&self) -> Result<(), AuthenticationError> {
        Ok(())
    }

    async fn fetch_all_remote_records(&self) -> Result<RemoteChanges, FetchError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::FetchAll, None) {
            return Err(failure.fetch_error());
        }

        Ok(RemoteChanges {
            updated: state.records.values().map(|s| s.remote.clone()).collect(),
            deleted: Vec::new(),
            change_token: state.token(),
        })
    }

    async fn fetch_changed_remote_records(
        &self,
        change_token: &ChangeToken,
    ) -> Result<RemoteChanges, FetchError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::FetchChanged, None) {
            return Err(failure.fetch_error());
        }

        let bytes: [u8; 8] = change_token
            .as_bytes()
            .try_into()
            .map_err(|_| FetchError::InvalidChangeToken)?;
        let since = u64::from_be_bytes(bytes);

        Ok(RemoteChanges {
            updated: state
                .records
                .values()
                .filter(|s| s.changed_at > since)
                .map(|s| s.remote.clone())
                .collect(),
            deleted: state
                .tombstones
                .iter()
                .filter(|(seq, _)| *seq > since)
                .map(|(_, id)| id.clone())
                .collect(),
            change_token: state.token(),
        })
    }

    async fn upload_record(&self, upload: &RecordUpload) -> Result<RemoteRecord, RecordError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::UploadRecord, Some(&upload.record_id)) {
            return Err(failure.record_error(&upload.record_id));
        }

        let remote_identifier = upload
            .previous
            .as_ref()
            .map(|previous| previous.identifier.clone())
            .unwrap_or_else(|| format!("remote-{}", upload.record_id.identifier));
        let version = Version::new(uuid::Uuid::new_v4().to_string(), Utc::now());
        let remote = RemoteRecord::from_metadata(&remote_identifier, version, &upload.metadata)
            .map_err(|err| RecordError::new(upload.record_id.clone(), err))?;

        let seq = state.next_seq();
        state.store(
            remote_identifier,
            remote.clone(),
            Arc::clone(&upload.object),
            upload.files.clone(),
            seq,
        );
        Ok(remote)
    }

    async fn download_record(
        &self,
        remote: &RemoteRecord,
        version: &Version,
    ) -> Result<DownloadedRecord, RecordError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::DownloadRecord, Some(&remote.record_id)) {
            return Err(failure.record_error(&remote.record_id));
        }

        let missing =
            || RecordError::from_service(remote.record_id.clone(), ServiceError::ItemDoesNotExist);
        let stored = state.records.get(&remote.identifier).ok_or_else(missing)?;
        let object = stored.history.get(&version.identifier).ok_or_else(missing)?;
        Ok(DownloadedRecord {
            object: Arc::clone(object),
            remote_files: stored.files.clone(),
        })
    }

    async fn delete_record(&self, remote: &RemoteRecord) -> Result<(), RecordError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::DeleteRecord, Some(&remote.record_id)) {
            return Err(failure.record_error(&remote.record_id));
        }

        if state.records.remove(&remote.identifier).is_none() {
            return Err(RecordError::from_service(
                remote.record_id.clone(),
                ServiceError::ItemDoesNotExist,
            ));
        }
        let seq = state.next_seq();
        state.tombstones.push((seq, remote.identifier.clone()));
        Ok(())
    }

    async fn upload_file(&self, file: &File, record_id: &RecordID) -> Result<RemoteFile, FileError> {
        let failure = self.state().enter(MockCall::UploadFile, Some(record_id));
        if let Some(failure) = failure {
            return Err(failure.file_error(&file.identifier));
        }

        let bytes = tokio::fs::read(&file.local_path)
            .await
            .map_err(|err| FileError::Io {
                file_identifier: file.identifier.clone(),
                message: err.to_string(),
            })?;

        let remote_file = RemoteFile {
            identifier: file.identifier.clone(),
            remote_identifier: format!("file-{}-{}", record_id.identifier, file.identifier),
            version_identifier: uuid::Uuid::new_v4().to_string(),
            size: bytes.len() as i64,
            content_hash: hash_bytes(&bytes),
        };
        self.state()
            .files
            .insert(remote_file.remote_identifier.clone(), bytes);
        Ok(remote_file)
    }

    async fn download_file(
        &self,
        remote_file: &RemoteFile,
        destination: &File,
    ) -> Result<(), FileError> {
        let bytes = {
            let mut state = self.state();
            if let Some(failure) = state.enter(MockCall::DownloadFile, None) {
                return Err(failure.file_error(&remote_file.identifier));
            }
            state
                .files
                .get(&remote_file.remote_identifier)
                .cloned()
                .ok_or_else(|| FileError::DoesNotExist(remote_file.identifier.clone()))?
        };

        let io_error = |err: std::io::Error| FileError::Io {
            file_identifier: destination.identifier.clone(),
            message: err.to_string(),
        };
        if let Some(parent) = destination.local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&destination.local_path, bytes)
            .await
            .map_err(io_error)
    }

    async fn delete_file(&self, remote_file: &RemoteFile) -> Result<(), FileError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::DeleteFile, None) {
            return Err(failure.file_error(&remote_file.identifier));
        }

        state
            .files
            .remove(&remote_file.remote_identifier)
            .map(|_| ())
            .ok_or_else(|| FileError::DoesNotExist(remote_file.identifier.clone()))
    }

    async fn update_metadata(
        &self,
        remote: &RemoteRecord,
        metadata: &Metadata,
    ) -> Result<(), RecordError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::UpdateMetadata, Some(&remote.record_id)) {
            return Err(failure.record_error(&remote.record_id));
        }
        let stored = state.records.get_mut(&remote.identifier).ok_or_else(|| {
            RecordError::from_service(remote.record_id.clone(), ServiceError::ItemDoesNotExist)
        })?;
        let updated =
            RemoteRecord::from_metadata(&remote.identifier, stored.remote.version.clone(), metadata)
                .map_err(|err| RecordError::new(remote.record_id.clone(), err))?;
        stored.remote.is_locked = updated.is_locked;
        stored.remote.previous_unlocked_version = updated.previous_unlocked_version;

        state
            .metadata_updates
            .insert(remote.identifier.clone(), metadata.clone());
        Ok(())
    }

    async fn fetch_versions(&self, remote: &RemoteRecord) -> Result<Vec<Version>, RecordError> {
        let mut state = self.state();
        if let Some(failure) = state.enter(MockCall::FetchVersions, Some(&remote.record_id)) {
            return Err(failure.record_error(&remote.record_id));
        }

        state
            .records
            .get(&remote.identifier)
            .map(|stored| stored.versions.clone())
            .ok_or_else(|| {
                RecordError::from_service(remote.record_id.clone(), ServiceError::ItemDoesNotExist)
            })
    }
}

// =============================================================================
// Test Object
// =============================================================================

/// A game with a play counter, optional relationships and files.
#[derive(Debug, Clone)]
pub(crate) struct TestObject {
    pub id: String,
    pub name: String,
    pub plays: i64,
    pub relationships: BTreeMap<String, RecordID>,
    pub files: Vec<File>,
    pub resolution: ConflictResolution,
    pub syncing: bool,
}

impl TestObject {
    pub fn new(id: &str) -> Self {
        TestObject {
            id: id.to_string(),
            name: format!("Game {id}"),
            plays: 0,
            relationships: BTreeMap::new(),
            files: Vec::new(),
            resolution: ConflictResolution::Conflict,
            syncing: true,
        }
    }

    pub fn with_plays(mut self, plays: i64) -> Self {
        self.plays = plays;
        self
    }

    pub fn with_relationship(mut self, key: &str, record_id: RecordID) -> Self {
        self.relationships.insert(key.to_string(), record_id);
        self
    }

    pub fn with_file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn record_id(&self) -> RecordID {
        RecordID::new("Game", self.id.clone())
    }

    pub fn shared(&self) -> Arc<dyn Syncable> {
        Arc::new(self.clone())
    }
}

impl Syncable for TestObject {
    fn syncable_type(&self) -> &str {
        "Game"
    }

    fn primary_key(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn syncable_keys(&self) -> Vec<String> {
        vec!["name".into(), "plays".into()]
    }

    fn syncable_value(&self, key: &str) -> Option<Value> {
        match key {
            "name" => Some(Value::from(self.name.clone())),
            "plays" => Some(Value::from(self.plays)),
            _ => None,
        }
    }

    fn syncable_relationships(&self) -> BTreeMap<String, RecordID> {
        self.relationships.clone()
    }

    fn syncable_files(&self) -> Vec<File> {
        self.files.clone()
    }

    fn syncable_metadata(&self) -> Metadata {
        Metadata::from([("plays".to_string(), self.plays.to_string())])
    }

    fn localized_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn is_syncing_enabled(&self) -> bool {
        self.syncing
    }

    fn resolve_conflict(&self, _record: &ManagedRecord) -> ConflictResolution {
        self.resolution
    }
}

// =============================================================================
// Test Object Store
// =============================================================================

/// Memory object store whose writes can be made to fail.
pub(crate) struct TestObjectStore {
    inner: MemoryObjectStore,
    fail_writes: AtomicBool,
}

impl TestObjectStore {
    pub fn new() -> Self {
        TestObjectStore {
            inner: MemoryObjectStore::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub async fn insert(&self, object: Arc<dyn Syncable>) -> DbResult<()> {
        self.inner.insert(object).await
    }

    /// Makes every following `apply_changes` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for TestObjectStore {
    async fn fetch_object(&self, record_id: &RecordID) -> DbResult<Option<Arc<dyn Syncable>>> {
        self.inner.fetch_object(record_id).await
    }

    async fn fetch_all_objects(&self) -> DbResult<Vec<Arc<dyn Syncable>>> {
        self.inner.fetch_all_objects().await
    }

    async fn apply_changes(&self, changes: ObjectChanges) -> DbResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::ObjectStore("disk full".into()));
        }
        self.inner.apply_changes(changes).await
    }
}

// =============================================================================
// Test Environment
// =============================================================================

/// Fresh temporary directory, removed when dropped.
pub(crate) fn temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("harmony-test-")
        .tempdir()
        .unwrap()
}

/// Config with millisecond retry delays.
pub(crate) fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.author.name = "Tester".into();
    config.sync.initial_retry_delay_ms = 1;
    config.sync.max_retry_elapsed_secs = 5;
    config
}

/// In-memory database, object store and mock backend wired together.
pub(crate) struct TestEnvironment {
    pub env: SyncEnvironment,
    pub service: Arc<MockService>,
    pub objects: Arc<TestObjectStore>,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let objects = Arc::new(TestObjectStore::new());
        let service = Arc::new(MockService::new());
        let controller = Arc::new(RecordController::new(db, objects.clone()));

        TestEnvironment {
            env: SyncEnvironment::new(controller, service.clone(), Arc::new(config)),
            service,
            objects,
        }
    }

    pub fn controller(&self) -> &Arc<RecordController> {
        &self.env.controller
    }

    /// Stores `object` locally and tracks it as a new local change.
    pub async fn add_local(&self, object: TestObject) -> RecordID {
        self.objects.insert(object.shared()).await.unwrap();

        let mut local = LocalRecord::new(RecordStatus::Updated, Utc::now());
        local.content_hash = Some(object.content_hash());
        self.insert(ManagedRecord::new(object.record_id()).with_local(local))
            .await;
        object.record_id()
    }

    /// Stores `object` locally and remotely with both sides in sync.
    pub async fn add_synced(&self, object: TestObject) -> (RecordID, RemoteRecord) {
        self.objects.insert(object.shared()).await.unwrap();
        let mut remote = self.service.put_remote(&object);
        remote.status = RecordStatus::Normal;

        let mut local = LocalRecord::new(RecordStatus::Normal, remote.version.date);
        local.version = Some(remote.version.clone());
        local.content_hash = Some(object.content_hash());
        local.remote_files = self.service.remote_files(&object.record_id());

        self.insert(
            ManagedRecord::new(object.record_id())
                .with_local(local)
                .with_remote(remote.clone()),
        )
        .await;
        (object.record_id(), remote)
    }

    pub async fn insert(&self, record: ManagedRecord) {
        let context = self.controller().new_context();
        context.insert(record);
        context.save().await.unwrap();
    }

    /// Applies `f` to a stored record.
    pub async fn update(&self, record_id: &RecordID, f: impl FnOnce(&mut ManagedRecord)) {
        let context = self.controller().new_context();
        let record = context.fetch_record(record_id).await.unwrap().unwrap();
        record.perform_mut(f);
        context.save().await.unwrap();
    }

    /// The stored record, read in a fresh context.
    pub async fn fetch(&self, record_id: &RecordID) -> Record {
        self.controller()
            .new_context()
            .fetch_record(record_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// The stored record as persisted, if any.
    pub async fn managed(&self, record_id: &RecordID) -> Option<ManagedRecord> {
        self.controller()
            .database()
            .records()
            .fetch(record_id)
            .await
            .unwrap()
    }

    pub async fn object(&self, record_id: &RecordID) -> Option<Arc<dyn Syncable>> {
        self.controller()
            .object_store()
            .fetch_object(record_id)
            .await
            .unwrap()
    }
}
