use crate::io::fs::filename_maybe;
use crate::utils::datetime::{date_format_precise, date_now};
use color_eyre::owo_colors::{OwoColorize, Style};
use env_logger::Env;
use log::{Level, LevelFilter, Record};
use std::io::Write;

fn get_file_line(record: &Record) -> String {
  let file = record.file().and_then(filename_maybe);
  match (file, record.line()) {
    (Some(file), None) => format!("{file}:",),
    (Some(file), Some(line)) => format!("{file}:{line:}:"),
    _ => "".to_owned(),
  }
  .dimmed()
  .to_string()
}

fn log_level_str(record: &Record) -> String {
  let mut level_str = record.level().to_string();
  level_str.truncate(1);
  level_str
}

fn color_log_level(record: &Record) -> String {
  let level_str = match record.level() {
    Level::Error => log_level_str(record).red().to_string(),
    Level::Warn => log_level_str(record).yellow().to_string(),
    Level::Info => log_level_str(record).cyan().dimmed().to_string(),
    Level::Debug => log_level_str(record).green().dimmed().to_string(),
    Level::Trace => log_level_str(record).dimmed().to_string(),
  };
  format!("{:}{level_str}{:}", "[".dimmed(), "]".dimmed())
}

/// Worker threads are named `worker-<rank>` by the parallel context; the name is shown in every log line
fn thread_name() -> String {
  std::thread::current().name().unwrap_or("main").dimmed().to_string()
}

pub fn setup_logger(filter_level: LevelFilter) {
  let res = env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
    .filter_level(filter_level)
    .format(|buf, record| {
      let file_line = get_file_line(record);
      let level = color_log_level(record);
      let date = date_format_precise(&date_now()).dimmed().to_string();
      let thread = thread_name();
      let args = record.args();
      writeln!(buf, "{date} {level:} {thread} {file_line:} {args}")?;
      Ok(())
    })
    .try_init();

  // Tests may initialize the logger more than once
  if res.is_err() {
    log::set_max_level(filter_level);
  }
}

/// Installs the error report hook. Frames of the standard library and of the parallel runtime are hidden from
/// backtraces.
pub fn global_init() {
  let res = color_eyre::config::HookBuilder::default()
    .display_env_section(false)
    .theme(color_eyre::config::Theme::dark().dependency_code(Style::new().dimmed()))
    .add_frame_filter(Box::new(|frames| {
      frames.retain(|frame| {
        let hidden_name = frame
          .name
          .as_ref()
          .is_some_and(|name| HIDDEN_FRAME_PREFIXES.iter().any(|&prefix| name.starts_with(prefix)));
        let hidden_file = frame
          .filename
          .as_ref()
          .is_some_and(|filename| filename.starts_with("/rustc/"));
        frame.name.is_some() && !hidden_name && !hidden_file
      });
    }))
    .install();

  if let Err(err) = res {
    eprintln!("Error report hook initialization failed: {err}");
  }
}

const HIDDEN_FRAME_PREFIXES: &[&str] = &[
  "__rust_try",
  "alloc::",
  "argmin::",
  "color_eyre::",
  "core::",
  "crossbeam",
  "eyre::",
  "rayon::",
  "rayon_core::",
  "std::",
  "<alloc::",
  "<core::",
  "<rayon",
];
