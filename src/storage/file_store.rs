use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Write};
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::codec::{Deserializer, Serializer};
use super::page_store::{
    MapHandle, PageStore, PageStoreConfig, PageStoreError, StorageBackend, StoreErrorCode,
    StoreResult,
};
use super::with_suffix;
use crate::common::{DEFAULT_RETENTION_TIME, SUFFIX_LOCK_FILE, SUFFIX_TEMP_FILE};
use crate::transaction::{LogTransactionManager, TransactionManager};

const MAGIC: &[u8; 8] = b"MVENGINE";
const FORMAT_VERSION: u8 = 1;
const FLAG_COMPRESS: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;
const HEADER_SIZE: u64 = 14;
const CHUNK_HEADER_SIZE: u64 = 8;

/// Backend that opens [`FilePageStore`]s and [`LogTransactionManager`]s on top of them.
#[derive(Debug, Default)]
pub struct FileBackend;

impl StorageBackend for FileBackend {
    fn open(&self, config: PageStoreConfig) -> StoreResult<Arc<dyn PageStore>> {
        let store: Arc<dyn PageStore> = FilePageStore::open(config)?;
        Ok(store)
    }

    fn open_transactions(
        &self,
        store: Arc<dyn PageStore>,
    ) -> StoreResult<Arc<dyn TransactionManager>> {
        let manager: Arc<dyn TransactionManager> = Arc::new(LogTransactionManager::open(store)?);
        Ok(manager)
    }

    fn compact_clean_up(&self, file_name: &Path) -> StoreResult<()> {
        compact_clean_up(file_name)
    }

    fn compact_offline(&self, config: &PageStoreConfig) -> StoreResult<()> {
        compact_offline(config)
    }
}

/// Removes the temporary file of a compaction that did not finish.
pub fn compact_clean_up(file_name: &Path) -> StoreResult<()> {
    let temp = with_suffix(file_name, SUFFIX_TEMP_FILE);
    if temp.exists() {
        info!(file = %temp.display(), "Removing leftover compaction file");
        fs::remove_file(&temp).map_err(|e| {
            PageStoreError::with_source(
                StoreErrorCode::WritingFailed,
                format!("Could not delete {}", temp.display()),
                e,
            )
        })?;
    }
    Ok(())
}

/// Opens a closed store file, rewrites it so that only live data remains and closes it again.
pub fn compact_offline(config: &PageStoreConfig) -> StoreResult<()> {
    let mut config = config.clone();
    config.read_only = false;
    config.auto_commit_delay = None;
    let store = FilePageStore::open(config)?;
    {
        let mut file = store.file.lock();
        if let Some(file) = file.as_mut() {
            let before = file.size;
            file.rewrite()?;
            info!(file = %file.path.display(), before, after = file.size, "Compacted store file");
        }
    }
    store.close()
}

#[derive(Default)]
struct StoredMap {
    id: u32,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Default)]
struct MapState {
    maps: BTreeMap<String, StoredMap>,
    next_map_id: u32,
    version: u64,
    dirty: bool,
}

impl MapState {
    fn lookup(&self, map: &MapHandle) -> StoreResult<&StoredMap> {
        self.maps
            .get(map.name())
            .filter(|stored| stored.id == map.id())
            .ok_or_else(|| unknown_map(map))
    }

    fn lookup_mut(&mut self, map: &MapHandle) -> StoreResult<&mut StoredMap> {
        self.maps
            .get_mut(map.name())
            .filter(|stored| stored.id == map.id())
            .ok_or_else(|| unknown_map(map))
    }

    fn encode(&self, version: u64) -> Vec<u8> {
        let mut serializer = Serializer::new();
        serializer.serialize_u64(version);
        serializer.serialize_u32(self.next_map_id);
        serializer.serialize_u32(self.maps.len() as u32);
        for (name, map) in &self.maps {
            serializer.serialize_u32(map.id);
            serializer.serialize_str(name);
            serializer.serialize_u32(map.entries.len() as u32);
            for (key, value) in &map.entries {
                serializer.serialize_bytes(key);
                serializer.serialize_bytes(value);
            }
        }
        serializer.end()
    }

    fn decode(payload: &[u8]) -> StoreResult<Self> {
        let mut deserializer = Deserializer::new(payload);
        let version = deserializer.deserialize_u64()?;
        let next_map_id = deserializer.deserialize_u32()?;
        let map_count = deserializer.deserialize_u32()?;
        let mut maps = BTreeMap::new();
        for _ in 0..map_count {
            let id = deserializer.deserialize_u32()?;
            let name = deserializer.deserialize_string()?;
            let entry_count = deserializer.deserialize_u32()?;
            let mut entries = BTreeMap::new();
            for _ in 0..entry_count {
                let key = deserializer.deserialize_bytes()?.to_vec();
                let value = deserializer.deserialize_bytes()?.to_vec();
                entries.insert(key, value);
            }
            maps.insert(name, StoredMap { id, entries });
        }
        Ok(Self {
            maps,
            next_map_id,
            version,
            dirty: false,
        })
    }
}

struct FileState {
    path: PathBuf,
    file: File,
    // held for its OS lock
    _lock: Option<File>,
    header: Vec<u8>,
    size: u64,
    // offset and length of the chunk holding the current version
    live_chunk: Option<(u64, u64)>,
    last_commit: Instant,
}

impl FileState {
    fn append_chunk(&mut self, payload: &[u8]) -> StoreResult<()> {
        let chunk = encode_chunk(payload);
        self.file.write_all_at(&chunk, self.size).map_err(|e| {
            PageStoreError::with_source(
                StoreErrorCode::WritingFailed,
                format!("Could not write chunk to {}", self.path.display()),
                e,
            )
        })?;
        self.live_chunk = Some((self.size, chunk.len() as u64));
        self.size += chunk.len() as u64;
        self.last_commit = Instant::now();
        Ok(())
    }

    fn live_len(&self) -> u64 {
        self.live_chunk.map(|(_, len)| len).unwrap_or(0)
    }

    /// Percentage of the chunk area still holding live data.
    fn fill_rate(&self) -> u32 {
        let used = self.size.saturating_sub(self.header.len() as u64);
        if used == 0 {
            100
        } else {
            (self.live_len() * 100 / used) as u32
        }
    }

    /// Replaces the file with one holding the header and the live chunk only.
    fn rewrite(&mut self) -> StoreResult<()> {
        let mut live = vec![0u8; self.live_len() as usize];
        if let Some((offset, _)) = self.live_chunk {
            self.file.read_exact_at(&mut live, offset).map_err(|e| {
                PageStoreError::with_source(
                    StoreErrorCode::ReadingFailed,
                    format!("Could not read live chunk of {}", self.path.display()),
                    e,
                )
            })?;
        }

        let temp = with_suffix(&self.path, SUFFIX_TEMP_FILE);
        let write_failed = |e: io::Error| {
            PageStoreError::with_source(
                StoreErrorCode::WritingFailed,
                format!("Could not write compacted file {}", temp.display()),
                e,
            )
        };
        let mut out = File::create(&temp).map_err(write_failed)?;
        out.write_all(&self.header).map_err(write_failed)?;
        out.write_all(&live).map_err(write_failed)?;
        out.sync_all().map_err(write_failed)?;
        drop(out);
        fs::rename(&temp, &self.path).map_err(write_failed)?;

        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                PageStoreError::with_source(
                    StoreErrorCode::ReadingFailed,
                    format!("Could not reopen {}", self.path.display()),
                    e,
                )
            })?;
        let header_len = self.header.len() as u64;
        self.live_chunk = self.live_chunk.map(|(_, len)| (header_len, len));
        self.size = header_len + live.len() as u64;
        Ok(())
    }
}

struct AutoCommit {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Page store keeping all maps in memory and appending a chunk with the live state on
/// every commit. Without a file name nothing is persisted.
pub struct FilePageStore {
    config: PageStoreConfig,
    state: RwLock<MapState>,
    file: Mutex<Option<FileState>>,
    closed: AtomicBool,
    read_count: AtomicU64,
    cache_size_mb: AtomicUsize,
    retention: Mutex<Duration>,
    auto_commit: Mutex<Option<AutoCommit>>,
}

impl FilePageStore {
    pub fn open(config: PageStoreConfig) -> StoreResult<Arc<Self>> {
        let read_count = AtomicU64::new(0);
        let (state, file) = match &config.file_name {
            Some(path) => {
                let (state, file) = open_file(path, &config, &read_count)?;
                (state, Some(file))
            }
            None => (MapState::default(), None),
        };

        let store = Arc::new(Self {
            cache_size_mb: AtomicUsize::new(config.cache_size_mb),
            config,
            state: RwLock::new(state),
            file: Mutex::new(file),
            closed: AtomicBool::new(false),
            read_count,
            retention: Mutex::new(DEFAULT_RETENTION_TIME),
            auto_commit: Mutex::new(None),
        });

        if let Some(delay) = store.config.auto_commit_delay {
            if store.file_name().is_some() && !store.config.read_only {
                store.start_auto_commit(delay);
            }
        }

        Ok(store)
    }

    fn start_auto_commit(self: &Arc<Self>, delay: Duration) {
        let (stop, stopped) = channel::<()>();
        let store: Weak<Self> = Arc::downgrade(self);
        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    if !store.state.read().dirty {
                        continue;
                    }
                    if let Err(e) = store.commit() {
                        error!("Background commit failed: {}", e);
                        if let Some(sink) = &store.config.background_errors {
                            _ = sink.send(e);
                        }
                        break;
                    }
                }
                _ => break,
            }
        });
        *self.auto_commit.lock() = Some(AutoCommit { stop, handle });
    }

    fn stop_auto_commit(&self) {
        if let Some(auto_commit) = self.auto_commit.lock().take() {
            drop(auto_commit.stop);
            if auto_commit.handle.thread().id() != thread::current().id() {
                _ = auto_commit.handle.join();
            }
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PageStoreError::closed())
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.config.read_only {
            Err(PageStoreError::new(
                StoreErrorCode::WritingFailed,
                "This store is read-only",
            ))
        } else {
            Ok(())
        }
    }

    fn reclaim(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<bool> {
        self.check_open()?;
        if self.config.read_only {
            return Ok(false);
        }
        let retention = *self.retention.lock();
        let mut file = self.file.lock();
        let Some(file) = file.as_mut() else {
            return Ok(false);
        };
        let fill_rate = file.fill_rate();
        if fill_rate >= target_fill_rate
            || file.live_len() > write_limit as u64
            || file.last_commit.elapsed() < retention
        {
            return Ok(false);
        }
        debug!(
            file = %file.path.display(),
            fill_rate,
            size = file.size,
            live = file.live_len(),
            "Compacting store file"
        );
        file.rewrite()?;
        Ok(true)
    }
}

impl PageStore for FilePageStore {
    fn open_map(&self, name: &str) -> StoreResult<MapHandle> {
        self.check_open()?;
        let mut state = self.state.write();
        if let Some(map) = state.maps.get(name) {
            return Ok(MapHandle::new(map.id, name));
        }
        self.check_writable()?;
        let id = state.next_map_id;
        state.next_map_id += 1;
        state.maps.insert(
            name.to_owned(),
            StoredMap {
                id,
                entries: BTreeMap::new(),
            },
        );
        state.dirty = true;
        Ok(MapHandle::new(id, name))
    }

    fn remove_map(&self, map: &MapHandle) -> StoreResult<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.lookup(map)?;
        state.maps.remove(map.name());
        state.dirty = true;
        Ok(())
    }

    fn has_map(&self, name: &str) -> bool {
        self.state.read().maps.contains_key(name)
    }

    fn map_names(&self) -> Vec<String> {
        self.state.read().maps.keys().cloned().collect()
    }

    fn get(&self, map: &MapHandle, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        Ok(state.lookup(map)?.entries.get(key).cloned())
    }

    fn put(&self, map: &MapHandle, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        state
            .lookup_mut(map)?
            .entries
            .insert(key.to_vec(), value.to_vec());
        state.dirty = true;
        Ok(())
    }

    fn delete(&self, map: &MapHandle, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_writable()?;
        let mut state = self.state.write();
        let old = state.lookup_mut(map)?.entries.remove(key);
        if old.is_some() {
            state.dirty = true;
        }
        Ok(old)
    }

    fn entries(&self, map: &MapHandle) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        Ok(state
            .lookup(map)?
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compact(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<bool> {
        self.reclaim(target_fill_rate, write_limit)
    }

    fn compact_move_chunks(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<()> {
        self.reclaim(target_fill_rate, write_limit).map(|_| ())
    }

    fn commit(&self) -> StoreResult<u64> {
        self.check_open()?;
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(state.version);
        }
        let version = state.version + 1;
        if let Some(file) = self.file.lock().as_mut() {
            self.check_writable()?;
            file.append_chunk(&state.encode(version))?;
        }
        state.version = version;
        state.dirty = false;
        Ok(version)
    }

    fn sync(&self) -> StoreResult<()> {
        self.check_open()?;
        if let Some(file) = self.file.lock().as_ref() {
            file.file.sync_all().map_err(|e| {
                PageStoreError::with_source(
                    StoreErrorCode::WritingFailed,
                    format!("Could not sync {}", file.path.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    fn set_retention_time(&self, retention: Duration) {
        *self.retention.lock() = retention;
    }

    fn set_cache_size(&self, mb: usize) {
        self.cache_size_mb.store(mb, Ordering::Relaxed);
    }

    fn cache_size(&self) -> usize {
        self.cache_size_mb.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn file_name(&self) -> Option<PathBuf> {
        self.config.file_name.clone()
    }

    fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    fn input_stream(&self) -> StoreResult<Box<dyn Read + Send>> {
        self.check_open()?;
        let path = self.file_name().ok_or_else(|| {
            PageStoreError::new(StoreErrorCode::Internal, "In-memory store has no file")
        })?;
        let file = File::open(&path).map_err(|e| {
            PageStoreError::with_source(
                StoreErrorCode::ReadingFailed,
                format!("Could not open {}", path.display()),
                e,
            )
        })?;
        Ok(Box::new(file))
    }

    fn close(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.stop_auto_commit();
        if !self.config.read_only {
            self.commit()?;
            self.sync()?;
        }
        self.closed.store(true, Ordering::Release);
        self.file.lock().take();
        Ok(())
    }

    fn close_immediately(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_auto_commit();
        self.file.lock().take();
    }
}

fn unknown_map(map: &MapHandle) -> PageStoreError {
    PageStoreError::new(
        StoreErrorCode::UnknownMap,
        format!("Map {} (id {}) does not exist", map.name(), map.id()),
    )
}

fn encode_chunk(payload: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(payload.len() + CHUNK_HEADER_SIZE as usize);
    chunk.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    chunk.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    chunk.extend_from_slice(payload);
    chunk
}

/// Check value stored in the header so that a wrong key is detected on open.
fn key_check(password: &[u16]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(MAGIC);
    for unit in password {
        hasher.update(&unit.to_be_bytes());
    }
    hasher.finalize()
}

fn encode_header(config: &PageStoreConfig) -> Vec<u8> {
    let mut flags = 0;
    if config.compress {
        flags |= FLAG_COMPRESS;
    }
    let check = match &config.encryption_key {
        Some(password) => {
            flags |= FLAG_ENCRYPTED;
            key_check(password)
        }
        None => 0,
    };
    let mut header = Vec::with_capacity(HEADER_SIZE as usize);
    header.extend_from_slice(MAGIC);
    header.push(FORMAT_VERSION);
    header.push(flags);
    header.extend_from_slice(&check.to_be_bytes());
    header
}

fn check_header(header: &[u8], path: &Path, config: &PageStoreConfig) -> StoreResult<()> {
    if &header[..MAGIC.len()] != MAGIC || header[MAGIC.len()] != FORMAT_VERSION {
        return Err(PageStoreError::corrupt(format!(
            "File {} is not a store file or has an unsupported format",
            path.display()
        )));
    }
    let flags = header[MAGIC.len() + 1];
    let mut check = [0u8; 4];
    check.copy_from_slice(&header[MAGIC.len() + 2..HEADER_SIZE as usize]);
    let check = u32::from_be_bytes(check);
    let matches = match (&config.encryption_key, flags & FLAG_ENCRYPTED != 0) {
        (Some(password), true) => key_check(password) == check,
        (None, false) => true,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(PageStoreError::corrupt(format!(
            "File {} could not be read with the given encryption key",
            path.display()
        )))
    }
}

fn lock_file(path: &Path, read_only: bool) -> StoreResult<Option<File>> {
    let lock_path = with_suffix(path, SUFFIX_LOCK_FILE);
    let lock = if read_only {
        match File::open(&lock_path) {
            Ok(lock) => lock,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(reading_failed(&lock_path, e)),
        }
    } else {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| reading_failed(&lock_path, e))?
    };
    let locked = if read_only {
        lock.try_lock_shared()
    } else {
        lock.try_lock()
    };
    match locked {
        Ok(()) => Ok(Some(lock)),
        Err(TryLockError::WouldBlock) => Err(PageStoreError::new(
            StoreErrorCode::FileLocked,
            format!("The file {} is locked", path.display()),
        )),
        Err(TryLockError::Error(e)) => Err(reading_failed(&lock_path, e)),
    }
}

fn reading_failed(path: &Path, e: io::Error) -> PageStoreError {
    PageStoreError::with_source(
        StoreErrorCode::ReadingFailed,
        format!("Could not read {}", path.display()),
        e,
    )
}

fn open_file(
    path: &Path,
    config: &PageStoreConfig,
    read_count: &AtomicU64,
) -> StoreResult<(MapState, FileState)> {
    let lock = lock_file(path, config.read_only)?;

    if !path.exists() {
        if config.read_only {
            return Err(reading_failed(
                path,
                io::Error::new(io::ErrorKind::NotFound, "store file does not exist"),
            ));
        }
        let header = encode_header(config);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| reading_failed(path, e))?;
        file.write_all(&header)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                PageStoreError::with_source(
                    StoreErrorCode::WritingFailed,
                    format!("Could not initialize {}", path.display()),
                    e,
                )
            })?;
        let file = FileState {
            path: path.to_owned(),
            file,
            _lock: lock,
            size: header.len() as u64,
            header,
            live_chunk: None,
            last_commit: Instant::now(),
        };
        return Ok((MapState::default(), file));
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(!config.read_only)
        .open(path)
        .map_err(|e| reading_failed(path, e))?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|e| reading_failed(path, e))?;

    if (content.len() as u64) < HEADER_SIZE {
        return Err(PageStoreError::corrupt(format!(
            "File {} is too short to be a store file",
            path.display()
        )));
    }
    let header = content[..HEADER_SIZE as usize].to_vec();
    check_header(&header, path, config)?;

    let mut pos = HEADER_SIZE;
    let mut live_chunk = None;
    while pos + CHUNK_HEADER_SIZE <= content.len() as u64 {
        let start = pos as usize;
        let len = u32::from_be_bytes([
            content[start],
            content[start + 1],
            content[start + 2],
            content[start + 3],
        ]) as u64;
        let crc = u32::from_be_bytes([
            content[start + 4],
            content[start + 5],
            content[start + 6],
            content[start + 7],
        ]);
        let end = pos + CHUNK_HEADER_SIZE + len;
        if end > content.len() as u64 {
            break;
        }
        let payload = &content[(pos + CHUNK_HEADER_SIZE) as usize..end as usize];
        if crc32fast::hash(payload) != crc {
            break;
        }
        read_count.fetch_add(1, Ordering::Relaxed);
        live_chunk = Some((pos, end - pos));
        pos = end;
    }

    if pos < content.len() as u64 {
        debug!(
            file = %path.display(),
            valid = pos,
            total = content.len(),
            "Ignoring incomplete chunk at the end of the store file"
        );
        if !config.read_only {
            file.set_len(pos).map_err(|e| {
                PageStoreError::with_source(
                    StoreErrorCode::WritingFailed,
                    format!("Could not truncate {}", path.display()),
                    e,
                )
            })?;
        }
    }

    let state = match live_chunk {
        Some((offset, len)) => MapState::decode(
            &content[(offset + CHUNK_HEADER_SIZE) as usize..(offset + len) as usize],
        )?,
        None => MapState::default(),
    };

    let file = FileState {
        path: path.to_owned(),
        file,
        _lock: lock,
        header,
        size: pos,
        live_chunk,
        last_commit: Instant::now(),
    };
    Ok((state, file))
}
