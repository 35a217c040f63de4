//! Workflow tests against the in-memory runtime

use harbor_lib::models::{ContainerState, ExecOutput, WorkloadOutcome};
use harbor_lib::naming::DeploymentName;
use harbor_lib::{
    DeployOptions, HarborError, MemoryRuntime, Orchestrator, Project, WorkloadOptions,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    runtime: MemoryRuntime,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let project = Project::init(dir.path()).unwrap();
        fs::write(
            dir.path().join("src/train_iris.py"),
            "import pickle\npickle.dump({}, open('output/iris.pkl', 'wb'))\n",
        )
        .unwrap();
        fs::write(dir.path().join("src/refresh_sales.py"), "print('refresh')\n").unwrap();
        fs::write(
            dir.path().join("src/deploy_iris.py"),
            "def api_predict(data):\n    return 'setosa'\n",
        )
        .unwrap();
        fs::write(dir.path().join("data/raw.csv"), "a,b\n1,2\n").unwrap();

        let runtime = MemoryRuntime::new();
        let orchestrator = Orchestrator::new(Arc::new(runtime.clone()), project);
        Self {
            dir,
            runtime,
            orchestrator,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn project_id(&self) -> String {
        self.orchestrator.project().id().to_string()
    }

    /// Scripts write `output/<file>` when they run
    fn script_writes(&self, script: &'static str, file: &'static str, contents: &'static str) {
        self.runtime.on_exec(move |container, argv| {
            let is_script = argv.first().map(String::as_str) == Some("bash")
                && argv.last().is_some_and(|cmd| cmd.contains(script));
            if !is_script {
                return None;
            }
            container.write_file(&format!("/var/harborml/output/{}", file), contents);
            Some(ExecOutput::success("done\n"))
        });
    }

    fn running(&self) -> Vec<String> {
        self.runtime
            .containers()
            .into_iter()
            .filter(|c| c.state == ContainerState::Running)
            .map(|c| c.name)
            .collect()
    }

    fn deployment(&self, model: &str, version: u32) -> String {
        DeploymentName::new(self.project_id(), model, version).encode()
    }
}

#[tokio::test]
async fn train_pulls_output_and_stops_container() {
    let h = Harness::new();
    h.script_writes("src/train_iris.py", "iris.pkl", "weights");

    let outcome = h
        .orchestrator
        .train("default", Path::new("train_iris.py"), WorkloadOptions::default())
        .await
        .unwrap();

    let output_dir = h.root().join("model/iris");
    assert!(matches!(&outcome, WorkloadOutcome::Completed { output_dir: dir } if *dir == output_dir));
    assert_eq!(fs::read_to_string(output_dir.join("iris.pkl")).unwrap(), "weights");
    assert!(h.running().is_empty());

    let containers = h.runtime.containers();
    let container = &containers[0];
    assert_eq!(container.image, "harborml_default:latest");
    assert!(container.read_file("/var/harborml/src/train_iris.py").is_some());
    assert!(container.read_file("/var/harborml/data/raw.csv").is_some());
    assert!(container.ran("set -o pipefail"));
}

#[tokio::test]
async fn failed_training_raises_and_cleans_up() {
    let h = Harness::new();
    h.runtime.on_exec(|_, argv| {
        (argv.first().map(String::as_str) == Some("bash"))
            .then(|| ExecOutput::failure(1, "Traceback: ZeroDivisionError\n"))
    });

    let err = h
        .orchestrator
        .train("default", Path::new("train_iris.py"), WorkloadOptions::default())
        .await
        .unwrap_err();

    match err {
        HarborError::WorkloadFailed { exit_code, output } => {
            assert_eq!(exit_code, 1);
            assert!(output.contains("ZeroDivisionError"));
        }
        other => panic!("expected WorkloadFailed, got {:?}", other),
    }
    assert_eq!(h.runtime.containers().len(), 1);
    assert!(h.running().is_empty());
    assert!(!h.root().join("model/iris").exists());
    assert_eq!(fs::read_dir(h.root().join("tmp")).unwrap().count(), 0);
}

#[tokio::test]
async fn keep_alive_returns_live_container() {
    let h = Harness::new();
    h.script_writes("src/train_iris.py", "iris.pkl", "weights");

    let outcome = h
        .orchestrator
        .train(
            "default",
            Path::new("src/train_iris.py"),
            WorkloadOptions {
                name: Some("iris_debug".to_string()),
                keep_alive: true,
            },
        )
        .await
        .unwrap();

    let WorkloadOutcome::KeptAlive { output_dir, container } = outcome else {
        panic!("container should be kept alive");
    };
    assert_eq!(output_dir, h.root().join("model/iris_debug"));
    assert_eq!(h.running(), vec![container.name]);
}

#[tokio::test]
async fn refresh_data_writes_dataset() {
    let h = Harness::new();
    h.script_writes("src/refresh_sales.py", "sales.csv", "day,total\n");

    let outcome = h
        .orchestrator
        .refresh_data("default", Path::new("refresh_sales.py"), WorkloadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.output_dir(), &h.root().join("data/sales"));
    assert_eq!(
        fs::read_to_string(h.root().join("data/sales/sales.csv")).unwrap(),
        "day,total\n"
    );
}

#[tokio::test]
async fn bad_script_names_fail_before_building() {
    let h = Harness::new();
    fs::write(h.root().join("src/model.py"), "").unwrap();
    fs::write(h.root().join("src/train_iris.jl"), "").unwrap();

    let err = h
        .orchestrator
        .train("default", Path::new("model.py"), WorkloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarborError::NamingExtractionFailed { .. }));

    let err = h
        .orchestrator
        .train("default", Path::new("train_iris.jl"), WorkloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarborError::UnsupportedType(_)));

    let err = h
        .orchestrator
        .train("default", Path::new("train_missing.py"), WorkloadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = h
        .orchestrator
        .train("gpu", Path::new("train_iris.py"), WorkloadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn three_deploys_swap_versions() {
    let h = Harness::new();
    let mut addresses = Vec::new();

    for expected in 0..3u32 {
        let report = h
            .orchestrator
            .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
            .await
            .unwrap();
        assert_eq!(report.version, expected);
        assert_eq!(report.container.name, h.deployment("iris", expected));
        assert_eq!(report.route, "/iris/");
        assert_eq!(
            report.retired,
            expected
                .checked_sub(1)
                .map(|v| h.deployment("iris", v))
                .into_iter()
                .collect::<Vec<_>>()
        );
        addresses.push(report.address);
    }

    assert_eq!(h.orchestrator.current_version("iris").await.unwrap(), Some(2));

    // Exactly one serving container for iris, plus the proxy
    let running = h.running();
    assert_eq!(running.len(), 2);
    assert!(running.contains(&h.deployment("iris", 2)));
    assert!(running.iter().any(|name| name.starts_with("reverse_proxy-")));

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.routes.len(), 1);
    assert_eq!(status.routes[0].path, "/iris/");
    assert_eq!(status.routes[0].upstream, Some(h.deployment("iris", 2)));

    let proxy = status.proxy.unwrap();
    let (conf, _) = h
        .orchestrator
        .router()
        .read_config(&proxy.container.id)
        .await
        .unwrap();
    assert_eq!(
        conf.upstreams().unwrap(),
        vec![(h.deployment("iris", 2), Some(addresses[2].clone()))]
    );

    let serving = h.runtime.container(&h.deployment("iris", 2)).unwrap();
    assert_eq!(addresses[2], format!("{}:5000", serving.ip_address));
    assert_eq!(serving.hostname.as_deref(), Some(h.deployment("iris", 2).as_str()));
    assert!(serving.read_file("/var/harborml/flask/app.py").is_some());
    assert!(serving.ran("FLASK_APP=/var/harborml/flask/app.py"));
}

#[tokio::test]
async fn deploy_ships_trained_artifacts() {
    let h = Harness::new();
    fs::create_dir_all(h.root().join("model/iris")).unwrap();
    fs::write(h.root().join("model/iris/iris.pkl"), "weights").unwrap();

    let report = h
        .orchestrator
        .deploy(
            "default",
            Path::new("deploy_iris.py"),
            DeployOptions {
                model_name: None,
                include_data: false,
            },
        )
        .await
        .unwrap();

    let serving = h.runtime.container(&report.container.name).unwrap();
    assert_eq!(serving.read_file("/var/harborml/model/iris/iris.pkl"), Some(&b"weights"[..]));
    assert!(serving.read_file("/var/harborml/data/raw.csv").is_none());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["model_name"], "iris");
    assert_eq!(json["version"], 0);
}

#[tokio::test]
async fn failed_route_update_keeps_previous_version() {
    let h = Harness::new();
    h.orchestrator
        .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
        .await
        .unwrap();

    h.runtime.on_exec(|_, argv| {
        (argv == ["nginx", "-t"]).then(|| ExecOutput::failure(1, "nginx: [emerg] invalid"))
    });
    let err = h
        .orchestrator
        .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarborError::ProxyConfig(_)));

    // v1 was stopped, v0 still serves and keeps the route
    let running = h.running();
    assert!(running.contains(&h.deployment("iris", 0)));
    assert!(!running.contains(&h.deployment("iris", 1)));
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.routes[0].upstream, Some(h.deployment("iris", 0)));

    // The failed number is never reused
    assert_eq!(h.orchestrator.current_version("iris").await.unwrap(), Some(1));
}

#[tokio::test]
async fn deploy_after_failed_deploy_retires_live_version() {
    let h = Harness::new();
    h.orchestrator
        .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
        .await
        .unwrap();

    let reject = Arc::new(AtomicBool::new(true));
    let flag = reject.clone();
    h.runtime.on_exec(move |_, argv| {
        (flag.load(Ordering::SeqCst) && argv == ["nginx", "-t"])
            .then(|| ExecOutput::failure(1, "nginx: [emerg] invalid"))
    });
    h.orchestrator
        .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
        .await
        .unwrap_err();
    reject.store(false, Ordering::SeqCst);

    let report = h
        .orchestrator
        .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
        .await
        .unwrap();
    assert_eq!(report.version, 2);
    assert_eq!(report.retired, vec![h.deployment("iris", 0)]);

    let serving: Vec<String> = h
        .running()
        .into_iter()
        .filter(|name| name.starts_with("deploy-"))
        .collect();
    assert_eq!(serving, vec![h.deployment("iris", 2)]);

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.routes[0].upstream, Some(h.deployment("iris", 2)));
}

#[tokio::test]
async fn undeploy_without_deployment_is_noop() {
    let h = Harness::new();
    assert_eq!(h.orchestrator.undeploy_single("iris").await.unwrap(), None);
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn undeploy_single_prunes_route() {
    let h = Harness::new();
    for _ in 0..2 {
        h.orchestrator
            .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
            .await
            .unwrap();
    }
    fs::write(h.root().join("src/api_churn.py"), "def api_predict(d):\n    return 0\n").unwrap();
    h.orchestrator
        .deploy("default", Path::new("api_churn.py"), DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(h.orchestrator.undeploy_single("iris").await.unwrap(), Some(1));
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.routes.len(), 1);
    assert_eq!(status.routes[0].path, "/churn/");
    assert!(!h.running().contains(&h.deployment("iris", 1)));

    // Second undeploy finds nothing running
    assert_eq!(h.orchestrator.undeploy_single("iris").await.unwrap(), None);

    // Redeploying continues the numbering
    let report = h
        .orchestrator
        .deploy("default", Path::new("deploy_iris.py"), DeployOptions::default())
        .await
        .unwrap();
    assert_eq!(report.version, 2);
}

#[tokio::test]
async fn undeploy_all_leaves_proxy_running() {
    let h = Harness::new();
    fs::write(h.root().join("src/deploy_churn.py"), "def api_predict(d):\n    return 0\n").unwrap();
    for script in ["deploy_iris.py", "deploy_churn.py"] {
        h.orchestrator
            .deploy("default", Path::new(script), DeployOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(h.orchestrator.undeploy_all().await.unwrap(), 2);

    let running = h.running();
    assert_eq!(running.len(), 1);
    assert!(running[0].starts_with("reverse_proxy-deploy-"));

    let status = h.orchestrator.status().await.unwrap();
    assert!(status.routes.is_empty());
    assert!(status.deployments.iter().all(|d| d.state != ContainerState::Running));
}
