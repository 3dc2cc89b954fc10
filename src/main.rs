use eyre::Result;

use bucket_validator::{cli, queue, service, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse();

    // Initialize logging first
    match bucket_validator::init_logging(args.log_file.as_deref(), args.verbose) {
        Ok(path) => println!("Logging to {}", path.display()),
        Err(e) => eprintln!("Warning: Failed to initialize logging: {}", e),
    }

    log::info!("================================================================================");
    log::info!("BUCKET VALIDATOR STARTING");
    log::info!("================================================================================");

    let (config_path, required) = args.config_path();
    let mut config = Config::load(&config_path, required)?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(path) = args.seen_set {
        config.seen_set_path = path;
    }

    if args.drain_queue {
        let mut jobs = service::connect_queue(&config).await?;
        let deleted = queue::drain(&mut jobs).await?;
        println!("Deleted {} queued jobs", deleted);
        return Ok(());
    }

    println!("Listening on beanstalkd {} (tube {})", config.beanstalk_host, config.tube);
    service::run(config).await?;
    println!("Stopped. All validators closed.");
    Ok(())
}
