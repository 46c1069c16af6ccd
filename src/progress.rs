//! Progress bar construction.

use indicatif::{ProgressBar, ProgressStyle};
use std::borrow::Cow;

const BYTES_TEMPLATE: &str = "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}";
const COUNT_TEMPLATE: &str =
    "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed";

fn visible() -> bool {
    atty::is(atty::Stream::Stderr)
}

fn styled(len: u64, template: &str) -> ProgressBar {
    if !visible() {
        return ProgressBar::hidden();
    }
    let style = ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░ ");
    let pb = ProgressBar::new(len);
    pb.set_style(style);
    pb
}

/// Byte progress for hashing or transferring one file.
pub(crate) fn bytes_bar(total: u64, message: impl Into<Cow<'static, str>>) -> ProgressBar {
    let pb = styled(total, BYTES_TEMPLATE);
    pb.set_message(message);
    pb
}

/// File count progress for the upload queue.
pub(crate) fn files_bar(total: u64, message: impl Into<Cow<'static, str>>) -> ProgressBar {
    let pb = styled(total, COUNT_TEMPLATE);
    pb.set_message(message);
    pb
}
