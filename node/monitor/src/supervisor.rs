use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::OpenOptions;
use tokio::process::Command;
use tracing::{info, warn};

/// External lifecycle control over pipeline processes
///
/// `log` is the file that receives whatever the operation prints.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Stop then start the runner pool
    async fn restart_runners(&self, log: &Path) -> io::Result<()>;

    async fn restart_generator(&self, log: &Path) -> io::Result<()>;

    /// Tear down and relaunch every pipeline process
    async fn restart_pipeline(&self, log: &Path) -> io::Result<()>;
}

/// Runs the deployment's shell scripts from one directory
#[derive(Debug, Clone)]
pub struct ScriptSupervisor {
    scripts: PathBuf,
}

impl ScriptSupervisor {
    pub fn new(scripts: impl Into<PathBuf>) -> Self {
        Self {
            scripts: scripts.into(),
        }
    }

    async fn run(&self, script: &str, log: &Path) -> io::Result<()> {
        let out = OpenOptions::new().create(true).append(true).open(log).await?;
        let err = out.try_clone().await?;
        let (out, err) = (out.into_std().await, err.into_std().await);
        let path = self.scripts.join(script);

        info!("Running {}", path.display());
        let status = Command::new("sh")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .status()
            .await?;

        if !status.success() {
            warn!("{} exited with {}", path.display(), status);
        }
        Ok(())
    }
}

#[async_trait]
impl Supervisor for ScriptSupervisor {
    async fn restart_runners(&self, log: &Path) -> io::Result<()> {
        self.run("kill_runners.sh", log).await?;
        self.run("run_runners.sh", log).await
    }

    async fn restart_generator(&self, log: &Path) -> io::Result<()> {
        self.run("run_generator.sh", log).await
    }

    async fn restart_pipeline(&self, log: &Path) -> io::Result<()> {
        self.run("kill_fuzzer.sh", log).await?;
        self.run("start_fuzzer.sh", log).await
    }
}
