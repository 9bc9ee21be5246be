use super::{Transition, VecEnv, worker_seed};
use crate::{
    env::EnvironmentDescription,
    error::IpcError,
    ipc::{Command, Reply, receive_packet, send_packet},
    tensor::Buffer,
};
use anyhow::{Context, Result, ensure};
use interprocess::local_socket::{
    GenericNamespaced, Listener, ListenerNonblockingMode, ListenerOptions, Stream, ToNsName,
    traits::Listener as _,
};
use std::{
    io::{BufReader, ErrorKind},
    path::PathBuf,
    process::Child,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

static SOCKET_COUNTER: AtomicUsize = AtomicUsize::new(0);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How to launch the worker processes.
#[derive(Debug, Clone)]
pub struct SubprocOptions {
    /// Path of the `nao-subproc-env` binary.
    pub worker: PathBuf,
    pub env_id: String,
    pub num_envs: usize,
    pub base_seed: u64,
    pub gui: bool,
    /// How long a freshly spawned worker may take to connect back.
    pub connect_timeout: Duration,
}

impl SubprocOptions {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Looks for the worker binary next to the running executable.
    pub fn default_worker() -> Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .context("current executable has no parent directory")?;
        Ok(dir.join(format!("nao-subproc-env{}", std::env::consts::EXE_SUFFIX)))
    }
}

struct SubprocessEnvHandle {
    rank: usize,
    seed: u64,
    child: Child,
    conn: BufReader<Stream>,
}

impl SubprocessEnvHandle {
    fn request(&mut self, command: Command) -> Result<Reply> {
        send_packet(&mut self.conn, command)?;
        self.receive()
    }

    fn receive(&mut self) -> Result<Reply> {
        let reply: Reply = receive_packet(&mut self.conn)
            .with_context(|| format!("lost connection to worker {}", self.rank))?;
        match reply {
            Reply::Failed { message } => Err(IpcError::Worker {
                rank: self.rank,
                message,
            }
            .into()),
            reply => Ok(reply),
        }
    }

    fn unexpected(&self, reply: &Reply) -> anyhow::Error {
        IpcError::UnexpectedReply {
            rank: self.rank,
            reply: reply.kind().to_owned(),
        }
        .into()
    }
}

pub struct SubprocVecEnv {
    handles: Vec<SubprocessEnvHandle>,
    env_description: EnvironmentDescription,
    closed: bool,
}

impl SubprocVecEnv {
    pub fn spawn(options: &SubprocOptions) -> Result<Self> {
        ensure!(
            options.num_envs > 0,
            "a vectorized env needs at least one worker"
        );
        let socket_name = format!(
            "nao-vec-env-{}-{}.sock",
            std::process::id(),
            SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let socket_ns_name = socket_name.as_str().to_ns_name::<GenericNamespaced>()?;
        let listener = ListenerOptions::new()
            .name(socket_ns_name)
            .nonblocking(ListenerNonblockingMode::Accept)
            .create_sync()?;
        let mut handles = Vec::with_capacity(options.num_envs);
        match Self::spawn_workers(options, &socket_name, &listener, &mut handles) {
            Ok(env_description) => Ok(Self {
                handles,
                env_description,
                closed: false,
            }),
            Err(err) => {
                for handle in handles.iter_mut() {
                    let _ = handle.child.kill();
                    let _ = handle.child.wait();
                }
                Err(err)
            }
        }
    }

    fn spawn_workers(
        options: &SubprocOptions,
        socket_name: &str,
        listener: &Listener,
        handles: &mut Vec<SubprocessEnvHandle>,
    ) -> Result<EnvironmentDescription> {
        let mut env_description = None;
        for rank in 0..options.num_envs {
            let seed = worker_seed(options.base_seed, rank);
            let mut command = std::process::Command::new(&options.worker);
            command.args([
                "--env-id",
                &options.env_id,
                "--rank",
                &rank.to_string(),
                "--seed",
                &seed.to_string(),
                "--socket-name",
                socket_name,
            ]);
            if options.gui {
                command.arg("--gui");
            }
            let mut child = command.spawn().map_err(|err| IpcError::WorkerSpawn {
                rank,
                reason: format!("{}: {err}", options.worker.display()),
            })?;
            tracing::debug!(rank, seed, pid = child.id(), "spawned env worker");
            let conn = match accept_worker(listener, &mut child, rank, options.connect_timeout) {
                Ok(stream) => BufReader::new(stream),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err);
                }
            };
            handles.push(SubprocessEnvHandle {
                rank,
                seed,
                child,
                conn,
            });
            let handle = handles
                .last_mut()
                .context("worker handle vanished after spawning")?;
            match handle.receive()? {
                Reply::Ready {
                    rank: worker_rank,
                    description,
                } if worker_rank == rank => {
                    env_description.get_or_insert(description);
                }
                reply => return Err(handle.unexpected(&reply)),
            }
        }
        env_description.context("no worker reported its environment")
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(IpcError::Closed.into());
        }
        Ok(())
    }
}

/// Waits for `child` to connect, giving up once it exits or `timeout` passes.
fn accept_worker(
    listener: &Listener,
    child: &mut Child,
    rank: usize,
    timeout: Duration,
) -> Result<Stream> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok(stream) => return Ok(stream),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(status) = child.try_wait()? {
            return Err(IpcError::WorkerSpawn {
                rank,
                reason: format!("exited with {status} before connecting"),
            }
            .into());
        }
        if Instant::now() >= deadline {
            return Err(IpcError::WorkerSpawn {
                rank,
                reason: format!("did not connect within {timeout:?}"),
            }
            .into());
        }
        std::thread::sleep(ACCEPT_POLL_INTERVAL);
    }
}

impl VecEnv for SubprocVecEnv {
    fn num_envs(&self) -> usize {
        self.handles.len()
    }

    fn seeds(&self) -> Vec<u64> {
        self.handles.iter().map(|h| h.seed).collect()
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.env_description.clone()
    }

    fn reset(&mut self) -> Result<Vec<Buffer>> {
        self.ensure_open()?;
        for handle in self.handles.iter_mut() {
            send_packet(&mut handle.conn, Command::Reset)?;
        }
        self.handles
            .iter_mut()
            .map(|handle| match handle.receive()? {
                Reply::Observation(obs) => Ok(obs),
                reply => Err(handle.unexpected(&reply)),
            })
            .collect()
    }

    fn step(&mut self, actions: Vec<Buffer>) -> Result<Vec<Transition>> {
        self.ensure_open()?;
        ensure!(
            actions.len() == self.handles.len(),
            "got {} actions for {} environments",
            actions.len(),
            self.handles.len()
        );
        // workers step concurrently, replies are collected in rank order
        for (handle, action) in self.handles.iter_mut().zip(actions) {
            send_packet(&mut handle.conn, Command::Step { action })?;
        }
        self.handles
            .iter_mut()
            .map(|handle| match handle.receive()? {
                Reply::Step(transition) => Ok(transition),
                reply => Err(handle.unexpected(&reply)),
            })
            .collect()
    }

    fn render(&mut self) -> Result<()> {
        self.ensure_open()?;
        for handle in self.handles.iter_mut() {
            match handle.request(Command::Render)? {
                Reply::Rendered => {}
                reply => return Err(handle.unexpected(&reply)),
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // every worker is reaped before the first failure is reported
        let mut first_err = None;
        for handle in self.handles.iter_mut() {
            let closed = match handle.request(Command::Close) {
                Ok(Reply::Closing) => Ok(()),
                Ok(reply) => Err(handle.unexpected(&reply)),
                Err(err) => Err(err),
            };
            if let Err(err) = closed {
                tracing::warn!(rank = handle.rank, "worker did not close cleanly: {err:#}");
                let _ = handle.child.kill();
                first_err.get_or_insert(err);
            }
            if let Err(err) = handle.child.wait() {
                tracing::warn!(rank = handle.rank, "failed to reap worker: {err}");
                first_err.get_or_insert(err.into());
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SubprocVecEnv {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for handle in self.handles.iter_mut() {
            let _ = handle.child.kill();
            let _ = handle.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod test {
    use super::{SOCKET_COUNTER, SubprocVecEnv, SubprocessEnvHandle};
    use crate::{
        env::{EnvironmentDescription, Space},
        error::IpcError,
        ipc::{Command, Reply, receive_packet, send_packet},
        vec_env::VecEnv,
    };
    use anyhow::Result;
    use interprocess::local_socket::{
        GenericNamespaced, ListenerOptions, Stream, ToNsName,
        traits::{Listener as _, Stream as _},
    };
    use std::{io::BufReader, sync::atomic::Ordering, thread::JoinHandle};

    /// A pool whose connections are answered by threads. Each thread waits for `Close` and
    /// sends back its reply, while `process` stands in for the worker process.
    fn scripted_pool(workers: Vec<(&str, Reply)>) -> (SubprocVecEnv, Vec<JoinHandle<Result<()>>>) {
        let socket_name = format!(
            "nao-vec-env-test-{}-{}.sock",
            std::process::id(),
            SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let listener = ListenerOptions::new()
            .name(socket_name.as_str().to_ns_name::<GenericNamespaced>().unwrap())
            .create_sync()
            .unwrap();
        let mut handles = Vec::new();
        let mut threads = Vec::new();
        for (rank, (process, reply)) in workers.into_iter().enumerate() {
            let name = socket_name.clone();
            threads.push(std::thread::spawn(move || -> Result<()> {
                let name = name.as_str().to_ns_name::<GenericNamespaced>()?;
                let mut conn = BufReader::new(Stream::connect(name)?);
                let command: Command = receive_packet(&mut conn)?;
                assert!(matches!(command, Command::Close));
                send_packet(&mut conn, reply)
            }));
            let child = std::process::Command::new(process)
                .arg("30")
                .spawn()
                .unwrap();
            handles.push(SubprocessEnvHandle {
                rank,
                seed: rank as u64,
                child,
                conn: BufReader::new(listener.accept().unwrap()),
            });
        }
        let env = SubprocVecEnv {
            handles,
            env_description: EnvironmentDescription::new(
                Space::continuous_from_dims(vec![2]),
                Space::continuous_from_dims(vec![1]),
            ),
            closed: false,
        };
        (env, threads)
    }

    #[test]
    fn close_reports_the_first_failure_after_reaping_every_worker() {
        // rank 0 never exits on its own, rank 1 exits right away
        let (mut env, threads) =
            scripted_pool(vec![("sleep", Reply::Rendered), ("true", Reply::Closing)]);
        let err = env.close().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpcError>(),
            Some(IpcError::UnexpectedReply { rank: 0, .. })
        ));
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
        let killed = env.handles[0].child.try_wait().unwrap().unwrap();
        assert!(!killed.success());
        let exited = env.handles[1].child.try_wait().unwrap().unwrap();
        assert!(exited.success());
        assert!(env.is_closed());
        env.close().unwrap();
    }

    #[test]
    fn clean_close_is_ok() {
        let (mut env, threads) =
            scripted_pool(vec![("true", Reply::Closing), ("true", Reply::Closing)]);
        env.close().unwrap();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
    }
}
