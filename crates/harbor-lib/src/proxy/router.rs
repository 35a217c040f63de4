//! Routing-table updates on the project's reverse proxy
//!
//! Every update is a read-modify-write of the proxy's config file guarded by
//! the `# harbor-revision` marker: the revision read at the start must still
//! be live right before the new file is pushed, otherwise the update aborts
//! with [`HarborError::RouteConflict`]. New files are validated with
//! `nginx -t` before the reload signal; a file that fails validation is
//! rolled back.

use super::conf::NginxConf;
use crate::archive::ArchiveTransport;
use crate::container::{ContainerLifecycleManager, StartOptions};
use crate::error::{HarborError, HarborResult};
use crate::image::ImageBuilder;
use crate::models::{ContainerRef, ContainerSummary};
use crate::naming;
use crate::project::Project;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Remote directory config files are staged in before being copied into place
const REMOTE_STAGING_DIR: &str = "/tmp/harbor-conf";

/// A route to install for a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub model_name: String,
    /// Upstream block name, the new deployment's container name
    pub upstream: String,
    /// `ip:port` of the new deployment
    pub address: String,
    /// Upstream of the version being replaced
    pub evict: Option<String>,
}

#[derive(Clone)]
pub struct ReverseProxyRouter {
    project: Project,
    lifecycle: ContainerLifecycleManager,
    images: ImageBuilder,
    transport: ArchiveTransport,
}

impl ReverseProxyRouter {
    pub fn new(
        project: Project,
        lifecycle: ContainerLifecycleManager,
        images: ImageBuilder,
        transport: ArchiveTransport,
    ) -> Self {
        Self {
            project,
            lifecycle,
            images,
            transport,
        }
    }

    fn proxy_name(&self) -> String {
        naming::proxy_container_name(self.project.id())
    }

    /// The project's proxy container, running or not
    pub async fn find_proxy(&self) -> HarborResult<Option<ContainerSummary>> {
        let name = self.proxy_name();
        Ok(self
            .lifecycle
            .list_by_name_prefix(&name)
            .await?
            .into_iter()
            .find(|c| c.container.name.trim_start_matches('/') == name))
    }

    /// The running proxy, if there is one
    pub async fn running_proxy(&self) -> HarborResult<Option<ContainerRef>> {
        Ok(self
            .find_proxy()
            .await?
            .filter(|proxy| proxy.state.is_running())
            .map(|proxy| proxy.container))
    }

    /// Reuse a running proxy, or build and start a fresh one.
    /// A stopped proxy under the canonical name is removed first.
    pub async fn ensure_proxy(&self) -> HarborResult<ContainerRef> {
        if let Some(existing) = self.find_proxy().await? {
            if existing.state.is_running() {
                debug!(proxy = %existing.container.name, "Reverse proxy already running");
                return Ok(existing.container);
            }
            self.lifecycle.remove_if_stopped(&existing.container.id).await?;
        }

        let config = self.project.config();
        info!(project_id = %self.project.id(), "Starting reverse proxy");
        let tag = self.images.build(&self.project, &config.proxy_container).await?;
        let started = self
            .lifecycle
            .start(
                &tag,
                StartOptions {
                    ports: HashMap::from([(config.proxy_listen_port, config.proxy_listen_port)]),
                    ..Default::default()
                },
            )
            .await?;

        match self.bootstrap(&started).await {
            Ok(proxy) => Ok(proxy),
            Err(err) => {
                if let Err(stop_err) = self.lifecycle.stop(&started.id).await {
                    warn!(proxy = %started.name, error = %stop_err, "Failed to stop proxy");
                }
                Err(err)
            }
        }
    }

    async fn bootstrap(&self, started: &ContainerRef) -> HarborResult<ContainerRef> {
        let proxy = self.lifecycle.rename(started, &self.proxy_name()).await?;

        let mut conf = NginxConf::parse(&self.project.proxy_conf()?)?;
        let revision = conf.revision();
        conf.set_revision(revision);
        self.install(&proxy.id, &conf.to_string()).await?;

        let out = self.lifecycle.exec(&proxy.id, vec!["nginx".into()]).await?;
        if !out.is_success() {
            return Err(HarborError::runtime("nginx", out.output.trim()));
        }
        info!(proxy = %proxy.name, "Reverse proxy started");
        Ok(proxy)
    }

    /// Fetch and parse the live config
    pub async fn read_config(&self, proxy: &str) -> HarborResult<(NginxConf, String)> {
        let conf_path = &self.project.config().proxy_conf_path;
        let file_name = Path::new(conf_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| HarborError::ProxyConfig(format!("bad config path {}", conf_path)))?;

        let scratch = self.project.scratch_dir();
        fs::create_dir_all(&scratch)?;
        let download = tempfile::Builder::new().prefix("conf-").tempdir_in(&scratch)?;
        self.transport.pull(proxy, conf_path, download.path()).await?;

        let raw = fs::read_to_string(download.path().join(file_name))?;
        Ok((NginxConf::parse(&raw)?, raw))
    }

    /// Point `/<model>/` at the new upstream, dropping the evicted upstream
    /// and whatever the old rule pointed at in the same write.
    /// Returns the new revision.
    pub async fn add_or_replace(&self, proxy: &str, update: &RouteUpdate) -> HarborResult<u64> {
        let listen_port = self.project.config().proxy_listen_port;
        let route = naming::route_path(&update.model_name);

        let revision = self
            .mutate(proxy, |conf| {
                if let Some(evict) = &update.evict {
                    conf.remove_upstream(evict)?;
                }
                if let Some(previous) = conf.route(&route)?.and_then(|r| r.upstream) {
                    conf.remove_upstream(&previous)?;
                }
                conf.remove_upstream(&update.upstream)?;
                conf.add_upstream(&update.upstream, &update.address)?;
                conf.upsert_location(&route, &update.upstream, listen_port)?;
                Ok(true)
            })
            .await?;

        info!(
            model = %update.model_name,
            upstream = %update.upstream,
            address = %update.address,
            revision,
            "Route updated"
        );
        Ok(revision)
    }

    /// Remove the route for one model. Returns whether anything changed.
    pub async fn remove_route(&self, proxy: &str, model_name: &str) -> HarborResult<bool> {
        let route = naming::route_path(model_name);

        let mut changed = false;
        self.mutate(proxy, |conf| {
            if let Some(upstream) = conf.remove_location(&route)? {
                conf.remove_upstream(&upstream)?;
                changed = true;
            }
            // Upstreams of this model left behind by interrupted deploys
            for (name, _) in conf.upstreams()? {
                let stale = naming::DeploymentName::decode(&name).is_some_and(|slot| {
                    slot.project_id == self.project.id() && slot.model_name == model_name
                });
                if stale {
                    changed |= conf.remove_upstream(&name)?;
                }
            }
            Ok(changed)
        })
        .await?;
        Ok(changed)
    }

    /// Remove every route and upstream belonging to this project
    pub async fn prune_all(&self, proxy: &str) -> HarborResult<usize> {
        let namespace = naming::namespace_prefix(self.project.id());
        let mut removed = 0;

        self.mutate(proxy, |conf| {
            for route in conf.routes()? {
                let ours = route
                    .upstream
                    .as_deref()
                    .is_some_and(|upstream| upstream.starts_with(&namespace));
                if ours {
                    conf.remove_location(&route.path)?;
                    removed += 1;
                }
            }
            let mut changed = removed > 0;
            for (name, _) in conf.upstreams()? {
                if name.starts_with(&namespace) {
                    changed |= conf.remove_upstream(&name)?;
                }
            }
            Ok(changed)
        })
        .await?;

        info!(routes = removed, "Pruned routes");
        Ok(removed)
    }

    /// Read, edit, and write back the config under revision check.
    /// `edit` returns whether it changed anything; unchanged configs are not
    /// written. Returns the live revision afterwards.
    async fn mutate<F>(&self, proxy: &str, edit: F) -> HarborResult<u64>
    where
        F: FnOnce(&mut NginxConf) -> HarborResult<bool>,
    {
        let (mut conf, previous) = self.read_config(proxy).await?;
        let expected = conf.revision();
        if !edit(&mut conf)? {
            return Ok(expected);
        }
        conf.set_revision(expected + 1);

        let (live, _) = self.read_config(proxy).await?;
        if live.revision() != expected {
            return Err(HarborError::RouteConflict {
                expected,
                found: live.revision(),
            });
        }

        self.install(proxy, &conf.to_string()).await?;
        if let Err(err) = self.validate(proxy).await {
            warn!(proxy = %proxy, error = %err, "Rejected proxy config, restoring previous");
            self.install(proxy, &previous).await?;
            return Err(err);
        }
        self.reload(proxy).await?;
        Ok(expected + 1)
    }

    /// Copy `contents` into place as the proxy's config file
    async fn install(&self, proxy: &str, contents: &str) -> HarborResult<()> {
        let conf_path = &self.project.config().proxy_conf_path;
        let scratch = self.project.scratch_dir();
        fs::create_dir_all(&scratch)?;
        let upload = tempfile::Builder::new().prefix("conf-").tempdir_in(&scratch)?;
        fs::write(upload.path().join("nginx.conf"), contents)?;

        self.transport.push(proxy, upload.path(), REMOTE_STAGING_DIR).await?;
        let out = self
            .lifecycle
            .exec(
                proxy,
                vec![
                    "cp".into(),
                    format!("{}/nginx.conf", REMOTE_STAGING_DIR),
                    conf_path.clone(),
                ],
            )
            .await?;
        if !out.is_success() {
            return Err(HarborError::runtime("cp", out.output.trim()));
        }
        Ok(())
    }

    async fn validate(&self, proxy: &str) -> HarborResult<()> {
        let out = self
            .lifecycle
            .exec(proxy, vec!["nginx".into(), "-t".into()])
            .await?;
        if out.is_success() {
            Ok(())
        } else {
            Err(HarborError::ProxyConfig(out.output.trim().to_string()))
        }
    }

    /// Signal nginx to re-read its config without dropping connections
    async fn reload(&self, proxy: &str) -> HarborResult<()> {
        let out = self
            .lifecycle
            .exec(proxy, vec!["nginx".into(), "-s".into(), "reload".into()])
            .await?;
        if !out.is_success() {
            return Err(HarborError::runtime("reload", out.output.trim()));
        }
        debug!(proxy = %proxy, "Proxy reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerState, ExecOutput};
    use crate::runtime::{ContainerRuntime, MemoryRuntime};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        runtime: MemoryRuntime,
        router: ReverseProxyRouter,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let project = Project::init(dir.path()).unwrap();
        let runtime = MemoryRuntime::new();
        let shared: Arc<dyn ContainerRuntime> = Arc::new(runtime.clone());
        let config = project.config().clone();
        let lifecycle = ContainerLifecycleManager::new(shared.clone(), config.clone());
        let router = ReverseProxyRouter::new(
            project.clone(),
            lifecycle,
            ImageBuilder::new(shared.clone()),
            ArchiveTransport::new(shared, config, project.scratch_dir()),
        );
        Fixture {
            _dir: dir,
            runtime,
            router,
        }
    }

    fn update(model: &str, upstream: &str, address: &str, evict: Option<&str>) -> RouteUpdate {
        RouteUpdate {
            model_name: model.to_string(),
            upstream: upstream.to_string(),
            address: address.to_string(),
            evict: evict.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_ensure_proxy_starts_once() {
        let f = fixture();
        let proxy = f.router.ensure_proxy().await.unwrap();
        assert!(proxy.name.starts_with("reverse_proxy-deploy-"));

        let again = f.router.ensure_proxy().await.unwrap();
        assert_eq!(again.id, proxy.id);

        let snapshot = f.runtime.container(&proxy.id).unwrap();
        assert_eq!(snapshot.ports.get(&5000), Some(&5000));
        assert!(snapshot.read_file("/etc/nginx/nginx.conf").is_some());
        assert!(snapshot.execs.iter().any(|argv| argv == &vec!["nginx".to_string()]));
    }

    #[tokio::test]
    async fn test_ensure_proxy_replaces_dead_instance() {
        let f = fixture();
        let first = f.router.ensure_proxy().await.unwrap();
        f.runtime.stop(&first.id, Default::default()).await.unwrap();

        let second = f.router.ensure_proxy().await.unwrap();
        assert_ne!(second.id, first.id);
        assert!(f.runtime.container(&first.id).is_none());
    }

    #[tokio::test]
    async fn test_ensure_proxy_stops_proxy_when_nginx_fails() {
        let f = fixture();
        f.runtime.on_exec(|_, argv| {
            (argv == ["nginx"]).then(|| ExecOutput::failure(1, "nginx: [emerg] bind() failed"))
        });

        let err = f.router.ensure_proxy().await.unwrap_err();
        match err {
            HarborError::RuntimeOperationFailed { operation, message } => {
                assert_eq!(operation, "nginx");
                assert!(message.contains("bind() failed"));
            }
            other => panic!("expected RuntimeOperationFailed, got {:?}", other),
        }
        let containers = f.runtime.containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_replace_route_bumps_revision() {
        let f = fixture();
        let proxy = f.router.ensure_proxy().await.unwrap();

        let first = f
            .router
            .add_or_replace(&proxy.id, &update("iris", "deploy-p-iris-0", "172.17.0.9:5000", None))
            .await
            .unwrap();
        let second = f
            .router
            .add_or_replace(
                &proxy.id,
                &update("iris", "deploy-p-iris-1", "172.17.0.10:5000", Some("deploy-p-iris-0")),
            )
            .await
            .unwrap();
        assert_eq!(second, first + 1);

        let (conf, _) = f.router.read_config(&proxy.id).await.unwrap();
        let routes = conf.routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].upstream.as_deref(), Some("deploy-p-iris-1"));
        assert_eq!(conf.upstreams().unwrap().len(), 1);

        let snapshot = f.runtime.container(&proxy.id).unwrap();
        assert!(snapshot.ran("reload"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rolled_back() {
        let f = fixture();
        let proxy = f.router.ensure_proxy().await.unwrap();
        let (before, raw_before) = f.router.read_config(&proxy.id).await.unwrap();

        f.runtime.on_exec(|_, argv| {
            (argv == ["nginx", "-t"]).then(|| ExecOutput::failure(1, "nginx: [emerg] host not found"))
        });
        let err = f
            .router
            .add_or_replace(&proxy.id, &update("iris", "deploy-p-iris-0", "nowhere:5000", None))
            .await
            .unwrap_err();
        assert!(matches!(err, HarborError::ProxyConfig(_)));

        let (after, raw_after) = f.router.read_config(&proxy.id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(raw_after, raw_before);
    }

    #[tokio::test]
    async fn test_concurrent_edit_conflicts() {
        let f = fixture();
        let proxy = f.router.ensure_proxy().await.unwrap();

        // Another writer lands between our read and our write
        let runtime = f.runtime.clone();
        let proxy_id = proxy.id.clone();
        let err = f
            .router
            .mutate(&proxy.id, move |conf| {
                runtime.with_container(&proxy_id, |c| {
                    c.write_file("/etc/nginx/nginx.conf", "# harbor-revision 41\nevents {}\nhttp {}\n");
                });
                conf.add_upstream("deploy-p-iris-0", "172.17.0.9:5000")?;
                Ok(true)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HarborError::RouteConflict { expected: 0, found: 41 }));

        // The competing write is left untouched
        let (conf, _) = f.router.read_config(&proxy.id).await.unwrap();
        assert_eq!(conf.revision(), 41);
        assert!(conf.upstreams().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_prune() {
        let f = fixture();
        let proxy = f.router.ensure_proxy().await.unwrap();
        let pid = f.router.project.id().to_string();
        let iris = format!("deploy-{}-iris-0", pid);
        let churn = format!("deploy-{}-churn-3", pid);

        f.router
            .add_or_replace(&proxy.id, &update("iris", &iris, "172.17.0.9:5000", None))
            .await
            .unwrap();
        f.router
            .add_or_replace(&proxy.id, &update("churn", &churn, "172.17.0.10:5000", None))
            .await
            .unwrap();

        assert!(f.router.remove_route(&proxy.id, "iris").await.unwrap());
        assert!(!f.router.remove_route(&proxy.id, "iris").await.unwrap());
        let (conf, _) = f.router.read_config(&proxy.id).await.unwrap();
        assert_eq!(conf.routes().unwrap().len(), 1);

        assert_eq!(f.router.prune_all(&proxy.id).await.unwrap(), 1);
        let (conf, _) = f.router.read_config(&proxy.id).await.unwrap();
        assert!(conf.routes().unwrap().is_empty());
        assert!(conf.upstreams().unwrap().is_empty());
    }
}
