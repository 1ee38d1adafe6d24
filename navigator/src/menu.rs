use chrono::DateTime;

use crate::buttons::ButtonEvent;
use crate::store::{KV_LAST_FULL_SYNC, KV_LAST_PING, Store};

/// What the supervisor does with a menu selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuAction {
    StartTrip(String),
    StopTrip(String),
    PlanTrip,
    ForceSync,
    CalibrateCompass,
    ExitMenu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Trips,
    Sync,
    Settings,
}

#[derive(Debug, Clone)]
enum ItemKind {
    Submenu(Section),
    Action(MenuAction),
    Info,
    Back,
}

#[derive(Debug, Clone)]
struct Item {
    label: String,
    kind: ItemKind,
    enabled: bool,
}

impl Item {
    fn info(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: ItemKind::Info,
            enabled: false,
        }
    }

    fn back() -> Self {
        Self {
            label: "Back".into(),
            kind: ItemKind::Back,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Screen {
    title: String,
    items: Vec<Item>,
    selected: usize,
}

/// Render-ready snapshot of the current menu.
#[derive(Debug, Clone)]
pub struct MenuView {
    pub title: String,
    pub items: Vec<MenuItemView>,
    pub selected: usize,
}

#[derive(Debug, Clone)]
pub struct MenuItemView {
    pub label: String,
    pub submenu: bool,
    pub enabled: bool,
}

/// Hierarchical menu state machine. Submenu contents are re-read from the
/// store on entry so the lists always reflect current data.
pub struct MenuController {
    stack: Vec<Screen>,
}

impl MenuController {
    pub fn new() -> Self {
        Self {
            stack: vec![main_screen()],
        }
    }

    fn current(&self) -> &Screen {
        self.stack.last().expect("menu stack never empties")
    }

    fn current_mut(&mut self) -> &mut Screen {
        self.stack.last_mut().expect("menu stack never empties")
    }

    pub fn view(&self) -> MenuView {
        let screen = self.current();
        MenuView {
            title: screen.title.clone(),
            items: screen
                .items
                .iter()
                .map(|item| MenuItemView {
                    label: item.label.clone(),
                    submenu: matches!(item.kind, ItemKind::Submenu(_)),
                    enabled: item.enabled,
                })
                .collect(),
            selected: screen.selected,
        }
    }

    /// Apply one button press. `Some(action)` hands control back to the
    /// supervisor; `None` means the menu consumed the press.
    pub async fn handle(
        &mut self,
        store: &Store,
        sync_enabled: bool,
        button: ButtonEvent,
    ) -> anyhow::Result<Option<MenuAction>> {
        match button {
            ButtonEvent::Up => {
                let screen = self.current_mut();
                if !screen.items.is_empty() {
                    screen.selected =
                        (screen.selected + screen.items.len() - 1) % screen.items.len();
                }
                Ok(None)
            }
            ButtonEvent::Down => {
                let screen = self.current_mut();
                if !screen.items.is_empty() {
                    screen.selected = (screen.selected + 1) % screen.items.len();
                }
                Ok(None)
            }
            ButtonEvent::Left => {
                if self.stack.len() > 1 {
                    self.stack.pop();
                    Ok(None)
                } else {
                    Ok(Some(MenuAction::ExitMenu))
                }
            }
            ButtonEvent::Right | ButtonEvent::Center => self.select(store, sync_enabled).await,
        }
    }

    async fn select(
        &mut self,
        store: &Store,
        sync_enabled: bool,
    ) -> anyhow::Result<Option<MenuAction>> {
        let screen = self.current();
        let Some(item) = screen.items.get(screen.selected) else {
            return Ok(None);
        };

        match item.kind.clone() {
            ItemKind::Submenu(section) => {
                let built = build_section(section, store, sync_enabled).await?;
                self.stack.push(built);
                Ok(None)
            }
            ItemKind::Back => {
                if self.stack.len() > 1 {
                    self.stack.pop();
                }
                Ok(None)
            }
            ItemKind::Action(action) => Ok(Some(action)),
            ItemKind::Info => Ok(None),
        }
    }
}

fn main_screen() -> Screen {
    Screen {
        title: "Main Menu".into(),
        items: vec![
            Item {
                label: "Trips".into(),
                kind: ItemKind::Submenu(Section::Trips),
                enabled: true,
            },
            Item {
                label: "Sync".into(),
                kind: ItemKind::Submenu(Section::Sync),
                enabled: true,
            },
            Item {
                label: "Settings".into(),
                kind: ItemKind::Submenu(Section::Settings),
                enabled: true,
            },
            Item {
                label: "Exit Menu".into(),
                kind: ItemKind::Action(MenuAction::ExitMenu),
                enabled: true,
            },
        ],
        selected: 0,
    }
}

async fn build_section(section: Section, store: &Store, sync_enabled: bool) -> anyhow::Result<Screen> {
    let screen = match section {
        Section::Trips => {
            let trips = store.get_trips(None).await?;
            let mut items = Vec::new();
            if trips.is_empty() {
                items.push(Item::info("No trips available"));
            }
            for trip in trips.iter().take(10) {
                let status = trip.effective_status();
                let label = format!("{} ({})", trip.title, status);
                let kind = if trip.is_active {
                    ItemKind::Action(MenuAction::StopTrip(trip.id.clone()))
                } else if status == "PLANNED" {
                    ItemKind::Action(MenuAction::StartTrip(trip.id.clone()))
                } else {
                    ItemKind::Info
                };
                let enabled = !matches!(kind, ItemKind::Info);
                items.push(Item { label, kind, enabled });
            }
            items.push(Item {
                label: "Plan New Trip".into(),
                kind: ItemKind::Action(MenuAction::PlanTrip),
                enabled: true,
            });
            items.push(Item::back());
            Screen {
                title: "Trips".into(),
                items,
                selected: 0,
            }
        }
        Section::Sync => {
            let mut items = Vec::new();
            if sync_enabled {
                items.push(Item::info("Sync: Enabled"));
                items.push(Item::info(format!(
                    "Last Ping: {}",
                    format_marker(store.kv_get(KV_LAST_PING).await?)
                )));
                items.push(Item::info(format!(
                    "Last Sync: {}",
                    format_marker(store.kv_get(KV_LAST_FULL_SYNC).await?)
                )));
                items.push(Item::info(format!(
                    "Pending Entries: {}",
                    store.pending_logbook_count().await?
                )));
                let last_entry = store
                    .recent_logbook(None, 1)
                    .await?
                    .into_iter()
                    .next()
                    .map(|entry| {
                        format!(
                            "Last Entry: {} ({:.1} km/h)",
                            format_marker(Some(entry.timestamp)),
                            entry.speed_kmh
                        )
                    })
                    .unwrap_or_else(|| "Last Entry: None".to_string());
                items.push(Item::info(last_entry));
                items.push(Item {
                    label: "Force Sync".into(),
                    kind: ItemKind::Action(MenuAction::ForceSync),
                    enabled: true,
                });
            } else {
                items.push(Item::info("Sync: Disabled"));
                items.push(Item::info("No sync key configured"));
            }
            items.push(Item::back());
            Screen {
                title: "Sync".into(),
                items,
                selected: 0,
            }
        }
        Section::Settings => {
            let mut items = Vec::new();
            items.push(Item::info(if sync_enabled {
                "Sync Key: Configured"
            } else {
                "Sync Key: Not configured"
            }));
            if !sync_enabled {
                items.push(Item::info("Configure via WiFi setup"));
            }
            if let Some(device) = store.get_device_info().await? {
                items.push(Item::info(format!("Device: {}", device.name)));
            }
            items.push(Item {
                label: "Calibrate Compass".into(),
                kind: ItemKind::Action(MenuAction::CalibrateCompass),
                enabled: true,
            });
            items.push(Item::back());
            Screen {
                title: "Settings".into(),
                items,
                selected: 0,
            }
        }
    };
    Ok(screen)
}

fn format_marker(value: Option<String>) -> String {
    match value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()) {
        Some(at) => at.format("%m/%d %H:%M").to_string(),
        None => "Never".to_string(),
    }
}
