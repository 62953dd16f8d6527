use shardis::config::{Config, ConfigError};
use shardis::{server, Error};

fn main() -> Result<(), Error> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Cli(err)) => err.exit(),
        Err(err) => return Err(err.into()),
    };

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads())
        .enable_all()
        .build()?
        .block_on(server::run(config))
}
