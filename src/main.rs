#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use rtp_restream::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.server.interfaces.is_empty() {
        log::warn!(
            "No interfaces are bound, no peer can connect, it's just a program without any functionality :-)"
        );

        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.max_threads.max(1))
        .enable_all()
        .build()?
        .block_on(rtp_restream::start_server(config))
}
