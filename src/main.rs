use anyhow::{Context, Result};
use clap::Parser;
use leafbit::config::{Cli, Config};
use leafbit::driver::Driver;
use leafbit::torrent::{Metainfo, Torrent};

fn main() -> Result<()> {
    let config: Config = Cli::parse().into();

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    let meta = Metainfo::from_path(&config.file_path)
        .with_context(|| format!("loading metainfo from {:?}", config.file_path))?;
    log::info!("loaded '{}' ({} pieces)", meta.name, meta.piece_count());

    let torrent = Torrent::load(meta, &config.save_path)
        .with_context(|| format!("preparing save directory {:?}", config.save_path))?;

    let mut driver = Driver::new(torrent, config.port);
    driver.run()
}
