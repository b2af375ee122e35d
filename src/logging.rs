use crate::folders::ensure_folder;
use failure::Error;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l:<5})} [{f}:{L}] {m}{n}";
const LOG_FILE_NAME: &str = "listener.log";

pub fn init_logging(log_folder: &Path, level: LevelFilter) -> Result<(), Error> {
    ensure_folder(log_folder)?;

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_folder.join(LOG_FILE_NAME))?;

    let config = log4rs::config::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .appender(Appender::builder().build("file", Box::new(file)))
        .build(
            Root::builder()
                .appender("stdout")
                .appender("file")
                .build(level),
        )
        .map_err(|e| format_err!("Invalid logging config: {}", e))?;

    log4rs::init_config(config).map_err(|e| format_err!("Unable to start logging: {}", e))?;
    Ok(())
}
