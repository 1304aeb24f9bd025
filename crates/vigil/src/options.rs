//! Per-watch backend options

/// Backend-specific watch options passed to
/// [`FileWatcher::add_watch_with_options`](crate::FileWatcher::add_watch_with_options).
///
/// Options a backend does not understand are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherOption {
    /// Completion buffer size in bytes for the Windows backend.
    ///
    /// The default of 63 KiB is occasionally too small under heavy churn
    /// and dropped kernel records surface as `WatcherFailed`. Values are
    /// clamped to `4096..=65536`. Network paths are additionally capped
    /// at 64 KiB, which the kernel enforces for remote handles.
    BufferSize(u32),

    /// Bitmask of `FILE_NOTIFY_CHANGE_*` categories the Windows backend
    /// subscribes to. Defaults to file name, directory name, size and
    /// last-write changes.
    NotifyFilter(u32),
}

/// Default completion buffer size for the Windows backend.
pub const DEFAULT_BUFFER_SIZE: u32 = 63 * 1024;

const MIN_BUFFER_SIZE: u32 = 4096;
const MAX_BUFFER_SIZE: u32 = 64 * 1024;

/// Effective completion buffer size for a watch, after clamping.
pub fn effective_buffer_size(options: &[WatcherOption]) -> u32 {
    options
        .iter()
        .find_map(|option| match option {
            WatcherOption::BufferSize(bytes) => Some(*bytes),
            _ => None,
        })
        .unwrap_or(DEFAULT_BUFFER_SIZE)
        .clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
}

/// Notify filter override for a watch, if one was supplied.
pub fn notify_filter(options: &[WatcherOption]) -> Option<u32> {
    options.iter().find_map(|option| match option {
        WatcherOption::NotifyFilter(mask) => Some(*mask),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_defaults_and_clamps() {
        assert_eq!(effective_buffer_size(&[]), DEFAULT_BUFFER_SIZE);
        assert_eq!(
            effective_buffer_size(&[WatcherOption::BufferSize(512)]),
            4096
        );
        assert_eq!(
            effective_buffer_size(&[WatcherOption::BufferSize(1 << 20)]),
            64 * 1024
        );
        assert_eq!(
            effective_buffer_size(&[WatcherOption::BufferSize(32 * 1024)]),
            32 * 1024
        );
    }

    #[test]
    fn notify_filter_is_passed_through() {
        assert_eq!(notify_filter(&[]), None);
        assert_eq!(
            notify_filter(&[
                WatcherOption::BufferSize(8192),
                WatcherOption::NotifyFilter(0b101),
            ]),
            Some(0b101)
        );
    }
}
