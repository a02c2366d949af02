use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use std::time::Duration;
use time::macros::format_description;

pub fn setup_logging(log_level_str: &str) -> Result<()> {
    let log_level = match log_level_str.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        other => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", other);
            LevelFilter::Info
        }
    };

    SimpleLogger::new()
        .with_level(log_level)
        // reqwest/hyper are chatty at DEBUG
        .with_module_level("reqwest", LevelFilter::Warn)
        .with_module_level("hyper_util", LevelFilter::Warn)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    Ok(())
}

pub fn setup_thread_pool(thread_count: usize) -> Result<usize> {
    let num_threads = if thread_count == 0 {
        let cores = num_cpus::get();
        info!("Auto-detected {} CPU cores. Using {} threads.", cores, cores);
        cores
    } else {
        info!("Using specified {} threads.", thread_count);
        thread_count
    };

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global() {
        error!("Failed to build global thread pool: {}. Proceeding with default.", e);
    }

    Ok(num_threads)
}

pub fn progress_bar(len: u64) -> Result<ProgressBar> {
    let progress_bar = ProgressBar::new(len);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")?
            .progress_chars("=> "),
    );
    Ok(progress_bar)
}

pub fn spinner(unit: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template(&format!("{{spinner:.green}} [{{elapsed_precise}}] {{pos}} {} {{msg}}", unit))?,
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    Ok(spinner)
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}
