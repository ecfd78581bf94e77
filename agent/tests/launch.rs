//! End-to-end launch scenarios against a stub container runtime.
//!
//! The stub stands in for the unprivileged runtime: it skips the runtime
//! flags up to the image artifact argument and executes the container command
//! directly, so the scenarios observe real child processes and real status
//! artifacts.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use perch_agent::Environment;
use perch_agent::Error;
use perch_agent::launcher::ContainerLauncher;
use perch_agent::supervisor;
use perch_endpoint::Endpoint;
use perch_endpoint::PodDirectory;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Serializes the scenarios: supervision reaps with `waitpid(-1)`, which must
/// not observe another scenario's children.
static SERIAL: Mutex<()> = Mutex::new(());

/// The stub runtime: skip flags up to the image argument, then execute the
/// container command.
const STUB_RUNTIME: &str = r#"#!/bin/sh
while [ "$#" -gt 0 ]; do
  arg="$1"
  shift
  case "$arg" in
    *.sif) break ;;
    --no-mount|--bind|--env-file|--security) shift ;;
  esac
done
exec "$@"
"#;

/// A scratch workspace with a stub runtime and an empty pod layout.
struct Fixture {
    root: TempDir,
    endpoint: Endpoint,
    pod_dir: PodDirectory,
    environment: Environment,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().expect("failed to create a temporary directory");

        let scratch = root.path().join("scratch");
        fs::create_dir_all(&scratch).expect("failed to create the scratch directory");

        let runtime = root.path().join("runtime");
        fs::write(&runtime, STUB_RUNTIME).expect("failed to write the stub runtime");
        fs::set_permissions(&runtime, fs::Permissions::from_mode(0o755))
            .expect("failed to mark the stub runtime executable");

        let endpoint = Endpoint::new(root.path().join("work"));
        let pod_dir = endpoint.pod("default", "demo");

        let environment = Environment::builder()
            .scratch(scratch)
            .dns_ip("10.96.0.10".parse::<IpAddr>().unwrap())
            .runtime(runtime.display().to_string())
            .build();

        Self {
            root,
            endpoint,
            pod_dir,
            environment,
        }
    }

    /// A path inside the workspace for scenario scratch files.
    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Builds the pod and creates the container directories the virtual
    /// kubelet would have materialized.
    fn pod(&self, init: &[Container], main: &[Container]) -> Pod {
        for container in init.iter().chain(main) {
            fs::create_dir_all(self.pod_dir.container(&container.name).path())
                .expect("failed to create a container directory");
        }

        Pod {
            spec: Some(PodSpec {
                init_containers: (!init.is_empty()).then(|| init.to_vec()),
                containers: main.to_vec(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn launcher(&self) -> ContainerLauncher {
        ContainerLauncher::new(
            self.environment.clone(),
            self.endpoint.clone(),
            self.pod_dir.clone(),
            "default",
            "demo",
        )
    }
}

/// Builds a container running the given command.
fn container(name: &str, command: &[&str]) -> Container {
    Container {
        name: name.to_string(),
        image: Some("busybox:latest".to_string()),
        command: Some(command.iter().map(ToString::to_string).collect()),
        ..Default::default()
    }
}

/// Reads a container artifact as a string.
fn read_artifact(path: &Path) -> String {
    fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read `{path}`: {e}", path = path.display()))
}

#[tokio::test]
async fn a_single_main_container_records_its_artifacts() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let pod = fixture.pod(
        &[],
        &[container("web", &["/bin/sh", "-c", "echo hi; exit 0"])],
    );

    let handles = fixture.launcher().spawn_main_containers(&pod);
    supervisor::supervise(CancellationToken::new(), handles)
        .await
        .unwrap();

    let dir = fixture.pod_dir.container("web");
    assert!(read_artifact(&dir.id_path()).starts_with("pid://"));
    assert_eq!(read_artifact(&dir.logs_path()), "hi\n");

    let exit_code: i32 = read_artifact(&dir.exit_code_path()).parse().unwrap();
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn init_containers_complete_before_main_containers_start() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let marker = fixture.path("marker");

    // The main container fails unless the init container's marker exists.
    let pod = fixture.pod(
        &[container(
            "prep",
            &["/bin/sh", "-c", &format!("touch {}", marker.display())],
        )],
        &[container(
            "app",
            &["/bin/sh", "-c", &format!("test -f {}", marker.display())],
        )],
    );

    let launcher = fixture.launcher();
    launcher.run_init_containers(&pod).await.unwrap();

    let prep = fixture.pod_dir.container("prep");
    assert_eq!(read_artifact(&prep.exit_code_path()), "0");

    let handles = launcher.spawn_main_containers(&pod);
    supervisor::supervise(CancellationToken::new(), handles)
        .await
        .unwrap();

    let app = fixture.pod_dir.container("app");
    assert_eq!(read_artifact(&app.exit_code_path()), "0");
}

#[tokio::test]
async fn a_failing_init_container_aborts_the_pod() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let pod = fixture.pod(
        &[
            container("prep", &["/bin/false"]),
            container("later", &["/bin/true"]),
        ],
        &[container("app", &["/bin/true"])],
    );

    let err = fixture
        .launcher()
        .run_init_containers(&pod)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InitFailed { ref name, exit_code } if name == "prep" && exit_code != 0
    ));

    let prep = fixture.pod_dir.container("prep");
    assert!(prep.id_path().is_file());
    assert_ne!(read_artifact(&prep.exit_code_path()), "0");

    // Neither the remaining init container nor the main container produced
    // any artifact.
    for name in ["later", "app"] {
        let dir = fixture.pod_dir.container(name);
        assert!(!dir.id_path().exists());
        assert!(!dir.exit_code_path().exists());
        assert!(!dir.logs_path().exists());
    }
}

#[tokio::test]
async fn main_containers_run_in_parallel() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let pod = fixture.pod(
        &[],
        &[
            container("first", &["/bin/sleep", "1"]),
            container("second", &["/bin/sleep", "1"]),
        ],
    );

    let start = Instant::now();
    let handles = fixture.launcher().spawn_main_containers(&pod);
    supervisor::supervise(CancellationToken::new(), handles)
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(1900),
        "containers did not run in parallel: took {elapsed:?}"
    );

    for name in ["first", "second"] {
        let dir = fixture.pod_dir.container(name);
        assert_eq!(read_artifact(&dir.exit_code_path()), "0");
    }
}

#[tokio::test]
async fn cancellation_drains_every_container() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let pod = fixture.pod(
        &[],
        &[
            container("first", &["/bin/sleep", "0.5"]),
            container("second", &["/bin/sleep", "0.5"]),
        ],
    );

    let shutdown = CancellationToken::new();
    let handles = fixture.launcher().spawn_main_containers(&pod);

    let cancel = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    supervisor::supervise(shutdown, handles).await.unwrap();

    // Draining waited for both containers: no exit code is missing for a
    // container that had an id.
    for name in ["first", "second"] {
        let dir = fixture.pod_dir.container(name);
        assert!(dir.id_path().is_file());
        assert_eq!(read_artifact(&dir.exit_code_path()), "0");
    }
}

#[tokio::test]
async fn a_faulty_main_container_does_not_prevent_its_siblings() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let pod = fixture.pod(
        &[],
        &[
            // An unresolvable image: this container's task returns without
            // writing any artifact.
            Container {
                name: "broken".to_string(),
                image: Some(String::new()),
                command: Some(vec!["/bin/true".to_string()]),
                ..Default::default()
            },
            container("app", &["/bin/sh", "-c", "exit 7"]),
        ],
    );

    let handles = fixture.launcher().spawn_main_containers(&pod);
    supervisor::supervise(CancellationToken::new(), handles)
        .await
        .unwrap();

    let broken = fixture.pod_dir.container("broken");
    assert!(!broken.id_path().exists());
    assert!(!broken.exit_code_path().exists());

    // The sibling's non-zero exit code is recorded and supervision still
    // completed cleanly.
    let app = fixture.pod_dir.container("app");
    assert_eq!(read_artifact(&app.exit_code_path()), "7");
}

#[tokio::test]
async fn an_environment_script_is_evaluated_into_the_scratch_directory() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let fixture = Fixture::new();
    let pod = fixture.pod(&[], &[container("web", &["/bin/true"])]);

    let dir = fixture.pod_dir.container("web");
    let script = dir.env_file_path();
    fs::write(&script, "#!/bin/sh\necho FOO=bar\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let handles = fixture.launcher().spawn_main_containers(&pod);
    supervisor::supervise(CancellationToken::new(), handles)
        .await
        .unwrap();

    let env_file = fixture
        .environment
        .instance_env_path("default_demo_web");
    assert_eq!(read_artifact(&env_file), "FOO=bar\n");
    assert_eq!(read_artifact(&dir.exit_code_path()), "0");
}
