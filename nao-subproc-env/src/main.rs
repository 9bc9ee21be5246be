// Worker process of `SubprocVecEnv`: hosts one environment and answers the pool's commands over
// a local socket until it is told to close or the pool goes away.

use anyhow::Result;
use clap::Parser;
use interprocess::local_socket::{
    GenericNamespaced, Stream, ToNsName, traits::Stream as StreamTrait,
};
use nao_core::{
    env::{BoxedEnv, Env, EnvOptions},
    ipc::{Command, Reply, receive_packet, send_packet},
    vec_env::SeededEnv,
};
use std::io::{BufReader, ErrorKind};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    env_id: String,

    #[arg(long)]
    rank: usize,

    #[arg(long)]
    seed: u64,

    #[arg(long)]
    socket_name: String,

    #[arg(long)]
    gui: bool,
}

struct Worker {
    rank: usize,
    conn: BufReader<Stream>,
    env: SeededEnv<BoxedEnv>,
}

impl Worker {
    fn handle(&mut self, command: Command) -> Result<Reply> {
        let reply = match command {
            Command::Reset => Reply::Observation(self.env.reset()?),
            Command::Step { action } => Reply::Step(self.env.step(action)?),
            Command::Render => {
                self.env.render()?;
                Reply::Rendered
            }
            Command::Close => {
                self.env.close()?;
                Reply::Closing
            }
        };
        Ok(reply)
    }

    fn run(mut self) -> Result<()> {
        loop {
            let command: Command = match receive_packet(&mut self.conn) {
                Ok(command) => command,
                Err(err) if is_disconnect(&err) => {
                    tracing::warn!(rank = self.rank, "pool disconnected, closing env");
                    return self.env.close();
                }
                Err(err) => return Err(err),
            };
            let closing = matches!(command, Command::Close);
            let reply = self.handle(command).unwrap_or_else(|err| Reply::Failed {
                message: format!("{err:#}"),
            });
            send_packet(&mut self.conn, reply)?;
            if closing {
                return Ok(());
            }
        }
    }
}

fn is_disconnect(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|err| err.kind() == ErrorKind::UnexpectedEof)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let socket_name = args.socket_name.as_str().to_ns_name::<GenericNamespaced>()?;
    let mut conn = BufReader::new(Stream::connect(socket_name)?);

    let registry = nao_gym::default_registry([args.env_id.as_str()]);
    let options = EnvOptions { gui: args.gui };
    let env = match registry.make(&args.env_id, &options) {
        Ok(env) => env,
        Err(err) => {
            send_packet(
                &mut conn,
                Reply::Failed {
                    message: format!("{err:#}"),
                },
            )?;
            return Err(err);
        }
    };
    send_packet(
        &mut conn,
        Reply::Ready {
            rank: args.rank,
            description: env.env_description(),
        },
    )?;
    tracing::debug!(rank = args.rank, seed = args.seed, env = %args.env_id, "worker ready");
    Worker {
        rank: args.rank,
        conn,
        env: SeededEnv::new(env, args.seed),
    }
    .run()
}
