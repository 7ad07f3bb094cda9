use std::time::{Duration, SystemTime};

use iocraft::prelude::*;
use tokio::sync::watch;

use crate::poll::{PollState, PollUpdate, ServiceState, ServiceStatus};
use crate::rest_types::{AppInfo, EntryKind, FileEntry, FileListing};

#[derive(Default, Props)]
pub struct ProgressBarProps {
    pub title: String,
    pub progress: Option<watch::Receiver<f32>>,
}

#[component]
pub fn ProgressBar(props: &ProgressBarProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let mut progress = hooks.use_state(|| 0.0f32);
    let receiver = props.progress.clone();

    hooks.use_future(async move {
        let Some(mut receiver) = receiver else {
            return;
        };
        while receiver.changed().await.is_ok() {
            let value = *receiver.borrow_and_update();
            progress.set(value.clamp(0.0, 100.0));
        }
    });

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(content: &props.title, weight: Weight::Bold)
            View(flex_direction: FlexDirection::Row) {
                View(border_style: BorderStyle::Round, border_color: Color::Blue, width: 60) {
                    View(width: Percent(progress.get()), height: 1, background_color: Color::Green)
                }
                View(padding: 1) {
                    Text(content: format!("{:.1}%", progress.get()))
                }
            }
        }
    }
}

#[derive(Default, Props)]
pub struct ReadinessProgressProps {
    pub updates: Option<watch::Receiver<PollUpdate>>,
    pub max_attempts: u32,
}

/// Live view of a readiness poll; exits the render loop once the poll settles.
#[component]
pub fn ReadinessProgress(
    props: &ReadinessProgressProps,
    mut hooks: Hooks,
) -> impl Into<AnyElement<'static>> {
    let mut system = hooks.use_context_mut::<SystemContext>();
    let mut update = hooks.use_state(PollUpdate::default);
    let receiver = props.updates.clone();

    hooks.use_future(async move {
        let Some(mut receiver) = receiver else {
            return;
        };
        update.set(receiver.borrow_and_update().clone());
        while receiver.changed().await.is_ok() {
            update.set(receiver.borrow_and_update().clone());
        }
    });

    let current = update.read().clone();
    if current.state != PollState::Starting {
        system.exit();
    }

    let (icon, label) = match current.state {
        PollState::Starting => (
            element!(Spinner()).into_any(),
            format!(
                " Waiting for services (attempt {}/{})",
                current.attempt, props.max_attempts
            ),
        ),
        PollState::Running => (
            element!(Text(color: Color::Green, content: "◆")).into_any(),
            " Services running".to_string(),
        ),
        PollState::Failed => (
            element!(Text(color: Color::Red, content: "▲")).into_any(),
            " Services did not start".to_string(),
        ),
    };

    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                #(Some(icon))
                Text(content: label)
            }
            View(flex_direction: FlexDirection::Row) {
                View(border_style: BorderStyle::Round, border_color: Color::Blue, width: 60) {
                    View(width: Percent(current.progress as f32), height: 1, background_color: Color::Green)
                }
                View(padding: 1) {
                    Text(content: format!("{:.2}%", current.progress))
                }
            }
        }
    }
}

#[derive(Default, Props)]
struct ServiceIconProps {
    state: Option<ServiceState>,
}

#[component]
fn ServiceIcon(props: &ServiceIconProps) -> impl Into<AnyElement<'static>> {
    match props.state {
        Some(ServiceState::Running) => element! {
            Text(color: Color::Green, content: "◆")
        }
        .into_any(),
        Some(ServiceState::Starting) => element! {
            Text(color: Color::Yellow, content: "◇")
        }
        .into_any(),
        Some(ServiceState::Failed) | Some(ServiceState::Error) => element! {
            Text(color: Color::Red, content: "▲")
        }
        .into_any(),
        None => element! {
            Text(color: Color::Yellow, content: "❓")
        }
        .into_any(),
    }
}

#[derive(Default, Props)]
pub struct ServiceStatusViewProps {
    pub status: Option<ServiceStatus>,
}

#[component]
pub fn ServiceStatusView(props: &ServiceStatusViewProps) -> impl Into<AnyElement<'static>> {
    let Some(status) = props.status.as_ref() else {
        return element!(Text(content: "No status reported")).into_any();
    };
    let services = [
        ("sscma-node", status.sscma_node),
        ("node-red", status.node_red),
        ("system", status.system),
    ];
    let uptime = Duration::from_secs(status.uptime().as_secs());

    element! {
        View(flex_direction: FlexDirection::Column) {
            #(services.into_iter().map(|(name, state)| element! {
                View(flex_direction: FlexDirection::Row) {
                    ServiceIcon(state: Some(state))
                    Text(weight: Weight::Bold, content: format!(" {:<12}", name))
                    Text(content: state.as_str())
                }
            }))
            Text(content: format!("Uptime: {}", humantime::format_duration(uptime)))
        }
    }
    .into_any()
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.1} {}", value, unit)
}

fn format_modified(modified: Option<SystemTime>) -> String {
    modified
        .map(|time| humantime::format_rfc3339_seconds(time).to_string())
        .unwrap_or_default()
}

fn entry_row(entry: &FileEntry) -> AnyElement<'static> {
    let (icon, color) = match entry.kind {
        EntryKind::Directory => ("▸", Color::Blue),
        EntryKind::File => (" ", Color::Reset),
    };
    let size = match entry.kind {
        EntryKind::Directory => String::new(),
        EntryKind::File => entry.size.map(format_size).unwrap_or_default(),
    };

    element! {
        View(flex_direction: FlexDirection::Row) {
            View(width: 2) {
                Text(color: color, content: icon)
            }
            View(width: 40) {
                Text(color: color, content: entry.name.clone())
            }
            View(width: 12) {
                Text(content: format!("{:>11}", size))
            }
            View(padding_left: 2) {
                Text(color: Color::DarkGrey, content: format_modified(entry.modified))
            }
        }
    }
    .into_any()
}

#[derive(Default, Props)]
pub struct FileListProps {
    pub listing: Option<FileListing>,
}

#[component]
pub fn FileList(props: &FileListProps) -> impl Into<AnyElement<'static>> {
    let Some(listing) = props.listing.as_ref() else {
        return element!(Text(content: "")).into_any();
    };
    let empty = listing.directories.is_empty() && listing.files.is_empty();

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, content: format!("{}:/{}", listing.storage, listing.path.trim_start_matches('/')))
            #(listing.directories.iter().chain(listing.files.iter()).map(entry_row))
            #(empty.then(|| element! {
                Text(color: Color::DarkGrey, content: "(empty)")
            }))
        }
    }
    .into_any()
}

#[derive(Default, Props)]
pub struct AppListProps {
    pub apps: Vec<AppInfo>,
}

#[component]
pub fn AppList(props: &AppListProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            #(props.apps.iter().map(|app| element! {
                View(flex_direction: FlexDirection::Row) {
                    View(width: 36) {
                        Text(color: Color::DarkGrey, content: app.app_id.clone())
                    }
                    Text(content: app.app_name.clone().unwrap_or_default())
                }
            }))
        }
    }
}

#[derive(Default, Props)]
pub struct SpinnerProps {
    pub color: Option<Color>,
}

#[component]
pub fn Spinner(props: &SpinnerProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let mut frame = hooks.use_state(|| 0usize);

    hooks.use_future(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
            frame.set((frame.get() + 1) % 4);
        }
    });

    let spinner_chars = ["◐", "◓", "◑", "◒"];
    let current_char = spinner_chars[*frame.read()];
    let color = props.color.unwrap_or(Color::Cyan);

    element! {
        Text(content: current_char, color: color)
    }
}

#[derive(Default, Props)]
pub struct MessageProps {
    pub message: String,
}

#[component]
pub fn ErrorMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Red, weight: Weight::Bold, content: "✗ ")
            Text(color: Color::Red, content: &props.message)
        }
    }
}

#[component]
pub fn SuccessMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Green, weight: Weight::Bold, content: "✓ ")
            Text(content: &props.message)
        }
    }
}

#[derive(Default, Props)]
pub struct InputPromptProps {
    pub prompt: String,
    pub default: Option<String>,
    pub description: Option<String>,
}

#[component]
pub fn InputPrompt(props: &InputPromptProps) -> impl Into<AnyElement<'static>> {
    let title = match &props.default {
        Some(default) => format!("{} [{}]", props.prompt, default),
        None => props.prompt.clone(),
    };

    element! {
        View(flex_direction: FlexDirection::Column, margin_top: 1) {
            Text(weight: Weight::Bold, content: title)
            #(props.description.as_ref().map(|description| element! {
                Text(color: Color::DarkGrey, content: description.clone())
            }))
        }
    }
}

#[component]
pub fn ConfigHeader() -> impl Into<AnyElement<'static>> {
    element! {
        View(
            border_style: BorderStyle::Round,
            border_color: Color::Blue,
            padding_left: 1,
            padding_right: 1,
            flex_direction: FlexDirection::Column,
        ) {
            Text(weight: Weight::Bold, content: "rcam configuration")
            Text(color: Color::DarkGrey, content: "Press enter to keep the value in brackets")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KiB");
        assert_eq!(format_size(2_621_440), "2.5 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_missing_modified_time_renders_blank() {
        assert_eq!(format_modified(None), "");
        assert_eq!(
            format_modified(Some(SystemTime::UNIX_EPOCH)),
            "1970-01-01T00:00:00Z"
        );
    }
}
