use std::sync::{Arc, Mutex};

use super::*;

/// A runner whose spawned child is pre-scripted, mirroring
/// `onefuzz_supervisor::worker::double::WorkerRunnerDouble`.
#[derive(Clone, Default)]
pub struct WorkerRunnerDouble {
    pub child: ChildDouble,
}

#[async_trait]
impl IWorkerRunner for WorkerRunnerDouble {
    async fn spawn(&self, _spec: &SpawnSpec) -> Result<Box<dyn IChildProcess>> {
        Ok(Box::new(self.child.clone()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChildDouble {
    pub pid: u32,
    inner: Arc<Mutex<ChildDoubleState>>,
}

#[derive(Debug, Default)]
struct ChildDoubleState {
    inbox: std::collections::VecDeque<Envelope>,
    sent: Vec<Envelope>,
    exit_status: Option<ExitStatus>,
    killed: bool,
    send_fails: bool,
}

impl ChildDouble {
    /// Queues a message the worker will receive on its next `try_recv`.
    pub fn push_incoming(&self, msg: Envelope) {
        self.inner.lock().unwrap().inbox.push_back(msg);
    }

    pub fn set_exited(&self, status: ExitStatus) {
        self.inner.lock().unwrap().exit_status = Some(status);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn was_killed(&self) -> bool {
        self.inner.lock().unwrap().killed
    }

    /// Makes the next and all subsequent `send` calls fail, simulating a
    /// broken pipe to an already-spawned child.
    pub fn set_send_fails(&self, fails: bool) {
        self.inner.lock().unwrap().send_fails = fails;
    }
}

#[async_trait]
impl IChildProcess for ChildDouble {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&mut self, msg: &Envelope) -> Result<()> {
        if self.inner.lock().unwrap().send_fails {
            anyhow::bail!("broken pipe");
        }
        self.inner.lock().unwrap().sent.push(msg.clone());
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Envelope> {
        self.inner.lock().unwrap().inbox.pop_front()
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.inner.lock().unwrap().exit_status)
    }

    async fn kill(&mut self) -> Result<()> {
        self.inner.lock().unwrap().killed = true;
        Ok(())
    }
}
