//! In-process container runtime
//!
//! Keeps a virtual filesystem per container and understands the handful of
//! commands harbor issues itself (`mkdir`, `test -d`, `cp`). Anything else is
//! offered to registered exec handlers, then treated as a successful no-op.

use super::ContainerRuntime;
use crate::error::{HarborError, HarborResult};
use crate::models::{
    ContainerDetails, ContainerRef, ContainerState, ContainerSummary, ExecOutput, RunSpec,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tar::{Archive, Builder, EntryType, Header};

/// Scripted exec behavior: return `Some` to handle the command
pub type ExecHandler =
    Arc<dyn Fn(&mut MemoryContainer, &[String]) -> Option<ExecOutput> + Send + Sync>;

/// A container held by [`MemoryRuntime`]
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub state: ContainerState,
    pub ip_address: String,
    pub ports: HashMap<u16, u16>,
    /// Absolute path -> contents
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    /// Every exec issued, in order
    pub execs: Vec<Vec<String>>,
    /// Directories created by `mkdir` that become visible after this many checks
    pending_dirs: Vec<(String, u32)>,
}

impl MemoryContainer {
    /// Create a directory and its parents
    pub fn mkdir_p(&mut self, path: &str) {
        let mut current = String::new();
        for part in normalize(path).split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    /// Write a file, creating parent directories
    pub fn write_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = normalize(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir_p(parent);
        }
        self.files.insert(path, contents.into());
    }

    pub fn read_file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(|v| v.as_slice())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize(path);
        path == "/" || self.dirs.contains(&path)
    }

    /// Whether any exec so far contained `needle` in one of its arguments
    pub fn ran(&self, needle: &str) -> bool {
        self.execs
            .iter()
            .any(|argv| argv.iter().any(|arg| arg.contains(needle)))
    }

    fn builtin_exec(&mut self, argv: &[String]) -> ExecOutput {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["mkdir", "-p", path] | ["mkdir", path] => {
                self.mkdir_p(path);
                ExecOutput::success("")
            }
            ["test", "-d", path] => {
                let path = normalize(path);
                if let Some(idx) = self.pending_dirs.iter().position(|(p, _)| *p == path) {
                    let (_, remaining) = &mut self.pending_dirs[idx];
                    if *remaining > 0 {
                        *remaining -= 1;
                        return ExecOutput::failure(1, "");
                    }
                    self.pending_dirs.remove(idx);
                }
                if self.is_dir(&path) {
                    ExecOutput::success("")
                } else {
                    ExecOutput::failure(1, "")
                }
            }
            ["cp", src, dst] => match self.files.get(&normalize(src)).cloned() {
                Some(contents) => {
                    self.write_file(dst, contents);
                    ExecOutput::success("")
                }
                None => ExecOutput::failure(1, format!("cp: cannot stat '{}'", src)),
            },
            _ => ExecOutput::success(""),
        }
    }
}

#[derive(Default)]
struct Inner {
    containers: Vec<MemoryContainer>,
    images: HashMap<String, String>,
    handlers: Vec<ExecHandler>,
    next_id: u64,
    mkdir_delay: u32,
    /// Programs whose exec fails at the runtime level
    broken_programs: Vec<String>,
}

impl Inner {
    fn find(&self, key: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.id == key || c.name == key)
    }

    fn find_running(&mut self, key: &str, operation: &'static str) -> HarborResult<&mut MemoryContainer> {
        let idx = self
            .find(key)
            .ok_or_else(|| HarborError::runtime(operation, format!("no such container: {}", key)))?;
        let container = &mut self.containers[idx];
        if !container.state.is_running() {
            return Err(HarborError::runtime(
                operation,
                format!("container {} is not running", key),
            ));
        }
        Ok(container)
    }
}

/// Container runtime that lives entirely in memory
#[derive(Default, Clone)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an exec handler; handlers run in registration order
    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&mut MemoryContainer, &[String]) -> Option<ExecOutput> + Send + Sync + 'static,
    {
        self.lock().handlers.push(Arc::new(handler));
    }

    /// Make directories created by `mkdir` invisible to the next `checks` readiness checks
    pub fn delay_mkdir(&self, checks: u32) {
        self.lock().mkdir_delay = checks;
    }

    /// Make every exec of `program` fail as if the daemon rejected it
    pub fn fail_exec(&self, program: &str) {
        self.lock().broken_programs.push(program.to_string());
    }

    /// Snapshot of every container, in creation order
    pub fn containers(&self) -> Vec<MemoryContainer> {
        self.lock().containers.clone()
    }

    /// Snapshot of one container by id or name
    pub fn container(&self, key: &str) -> Option<MemoryContainer> {
        let inner = self.lock();
        inner.find(key).map(|idx| inner.containers[idx].clone())
    }

    /// Mutate a container in place (for seeding test fixtures)
    pub fn with_container<R>(&self, key: &str, f: impl FnOnce(&mut MemoryContainer) -> R) -> Option<R> {
        let mut inner = self.lock();
        let idx = inner.find(key)?;
        Some(f(&mut inner.containers[idx]))
    }

    /// Tags of every image built so far
    pub fn images(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.lock().images.keys().cloned().collect();
        tags.sort();
        tags
    }
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn join(base: &str, relative: &str) -> String {
    normalize(&format!("{}/{}", base, relative))
}

fn io_err(context: &str) -> impl Fn(std::io::Error) -> HarborError + '_ {
    move |err| HarborError::transport(context.to_string(), err)
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn build_image(
        &self,
        context: Vec<u8>,
        build_file: &str,
        tag: &str,
    ) -> HarborResult<String> {
        let mut archive = Archive::new(context.as_slice());
        let mut has_build_file = false;
        for entry in archive.entries().map_err(io_err("build context"))? {
            let entry = entry.map_err(io_err("build context"))?;
            let path = entry.path().map_err(io_err("build context"))?;
            if normalize(&path.to_string_lossy()) == normalize(build_file) {
                has_build_file = true;
            }
        }
        if !has_build_file {
            return Err(HarborError::runtime(
                "build_image",
                format!("build file {} missing from context", build_file),
            ));
        }

        let mut inner = self.lock();
        inner.next_id += 1;
        let image_id = format!("sha256:{:064x}", inner.next_id);
        inner.images.insert(tag.to_string(), image_id.clone());
        Ok(image_id)
    }

    async fn run(&self, spec: RunSpec) -> HarborResult<ContainerRef> {
        let mut inner = self.lock();
        if !inner.images.contains_key(&spec.image) {
            return Err(HarborError::runtime(
                "create_container",
                format!("no such image: {}", spec.image),
            ));
        }
        if let Some(name) = &spec.name {
            if inner.find(name).is_some() {
                return Err(HarborError::runtime(
                    "create_container",
                    format!("name {} already in use", name),
                ));
            }
        }

        inner.next_id += 1;
        let n = inner.next_id;
        let container = MemoryContainer {
            id: format!("{:064x}", n),
            name: spec.name.unwrap_or_else(|| format!("container_{}", n)),
            image: spec.image,
            hostname: spec.hostname,
            state: ContainerState::Running,
            ip_address: format!("172.17.{}.{}", n / 250, n % 250 + 2),
            ports: spec.ports,
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            execs: Vec::new(),
            pending_dirs: Vec::new(),
        };
        let reference = ContainerRef {
            id: container.id.clone(),
            name: container.name.clone(),
        };
        inner.containers.push(container);
        Ok(reference)
    }

    async fn exec(
        &self,
        container: &str,
        argv: Vec<String>,
        detach: bool,
    ) -> HarborResult<ExecOutput> {
        let mut inner = self.lock();
        let handlers = inner.handlers.clone();
        let mkdir_delay = inner.mkdir_delay;
        let broken = argv
            .first()
            .is_some_and(|program| inner.broken_programs.contains(program));
        let target = inner.find_running(container, "exec")?;
        target.execs.push(argv.clone());
        if broken {
            return Err(HarborError::runtime("exec", format!("exec of {} rejected", argv[0])));
        }

        let mut result = None;
        for handler in &handlers {
            if let Some(out) = handler(target, &argv) {
                result = Some(out);
                break;
            }
        }
        let result = match result {
            Some(out) => out,
            None => {
                let out = target.builtin_exec(&argv);
                if mkdir_delay > 0 && argv.first().map(String::as_str) == Some("mkdir") {
                    if let Some(path) = argv.last() {
                        target.pending_dirs.push((normalize(path), mkdir_delay));
                    }
                }
                out
            }
        };

        if detach {
            Ok(ExecOutput::detached())
        } else {
            Ok(result)
        }
    }

    async fn put_archive(&self, container: &str, path: &str, archive: Vec<u8>) -> HarborResult<()> {
        let mut inner = self.lock();
        let target = inner.find_running(container, "put_archive")?;
        let base = normalize(path);
        if !target.is_dir(&base) {
            return Err(HarborError::NotFound(format!("{}:{}", container, path)));
        }

        let mut archive = Archive::new(archive.as_slice());
        for entry in archive.entries().map_err(io_err("unpack archive"))? {
            let mut entry = entry.map_err(io_err("unpack archive"))?;
            let relative = entry
                .path()
                .map_err(io_err("unpack archive"))?
                .to_string_lossy()
                .into_owned();
            let destination = join(&base, &relative);
            let kind = entry.header().entry_type();
            if kind.is_dir() {
                target.mkdir_p(&destination);
            } else if kind.is_file() {
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .map_err(io_err("unpack archive"))?;
                target.write_file(&destination, contents);
            }
        }
        Ok(())
    }

    async fn get_archive(&self, container: &str, path: &str) -> HarborResult<Vec<u8>> {
        let inner = self.lock();
        let idx = inner
            .find(container)
            .ok_or_else(|| HarborError::runtime("get_archive", format!("no such container: {}", container)))?;
        let target = &inner.containers[idx];
        let source = normalize(path);
        let root_name = Path::new(&source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut builder = Builder::new(Vec::new());
        if let Some(contents) = target.files.get(&source) {
            append_file(&mut builder, &root_name, contents)?;
        } else if target.is_dir(&source) {
            append_dir(&mut builder, &root_name)?;
            let prefix = format!("{}/", source.trim_end_matches('/'));
            for dir in target.dirs.iter().filter(|d| d.starts_with(&prefix)) {
                append_dir(&mut builder, &format!("{}/{}", root_name, &dir[prefix.len()..]))?;
            }
            for (file, contents) in target.files.iter().filter(|(f, _)| f.starts_with(&prefix)) {
                append_file(
                    &mut builder,
                    &format!("{}/{}", root_name, &file[prefix.len()..]),
                    contents,
                )?;
            }
        } else {
            return Err(HarborError::NotFound(format!("{}:{}", container, path)));
        }

        builder.into_inner().map_err(io_err("pack archive"))
    }

    async fn list(&self, name_filter: &str) -> HarborResult<Vec<ContainerSummary>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.name.contains(name_filter))
            .map(|c| ContainerSummary {
                container: ContainerRef {
                    id: c.id.clone(),
                    name: c.name.clone(),
                },
                state: c.state,
            })
            .collect())
    }

    async fn inspect(&self, container: &str) -> HarborResult<Option<ContainerDetails>> {
        let inner = self.lock();
        Ok(inner.find(container).map(|idx| {
            let c = &inner.containers[idx];
            ContainerDetails {
                container: ContainerRef {
                    id: c.id.clone(),
                    name: c.name.clone(),
                },
                state: c.state,
                hostname: c.hostname.clone(),
                ip_address: c.state.is_running().then(|| c.ip_address.clone()),
            }
        }))
    }

    async fn rename(&self, container: &str, new_name: &str) -> HarborResult<()> {
        let mut inner = self.lock();
        if inner.find(new_name).is_some() {
            return Err(HarborError::runtime(
                "rename_container",
                format!("name {} already in use", new_name),
            ));
        }
        let idx = inner.find(container).ok_or_else(|| {
            HarborError::runtime("rename_container", format!("no such container: {}", container))
        })?;
        inner.containers[idx].name = new_name.to_string();
        Ok(())
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> HarborResult<()> {
        let mut inner = self.lock();
        if let Some(idx) = inner.find(container) {
            if inner.containers[idx].state.is_running() {
                inner.containers[idx].state = ContainerState::Exited;
            }
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> HarborResult<()> {
        let mut inner = self.lock();
        if let Some(idx) = inner.find(container) {
            inner.containers.remove(idx);
        }
        Ok(())
    }
}

fn append_dir(builder: &mut Builder<Vec<u8>>, path: &str) -> HarborResult<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    builder
        .append_data(&mut header, format!("{}/", path), std::io::empty())
        .map_err(io_err("pack archive"))
}

fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, contents: &[u8]) -> HarborResult<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(contents.len() as u64);
    builder
        .append_data(&mut header, path, contents)
        .map_err(io_err("pack archive"))
}
