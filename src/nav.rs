//! Secondary navigation for each console section.
//!
//! One static table, keyed by route. Looked up per request, never loaded
//! dynamically.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NavItem {
    pub label: &'static str,
    pub path: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NavConfig {
    pub route: &'static str,
    pub title: &'static str,
    pub items: &'static [NavItem],
}

const fn item(label: &'static str, path: &'static str) -> NavItem {
    NavItem { label, path }
}

static NAV: &[NavConfig] = &[
    NavConfig {
        route: "dashboard",
        title: "Dashboard",
        items: &[
            item("Overview", "/dashboard"),
            item("Usage", "/dashboard/usage"),
        ],
    },
    NavConfig {
        route: "chatbot",
        title: "Chatbot",
        items: &[
            item("New Chat", "/chatbot"),
            item("History", "/chatbot/history"),
            item("Folders", "/chatbot/folders"),
            item("Bookmarks", "/chatbot/bookmarks"),
        ],
    },
    NavConfig {
        route: "schema",
        title: "Schema",
        items: &[
            item("Tables", "/schema/tables"),
            item("ML Models", "/schema/models"),
        ],
    },
    NavConfig {
        route: "reports",
        title: "Reports",
        items: &[
            item("Saved Reports", "/reports"),
            item("Scheduled", "/reports/scheduled"),
        ],
    },
    NavConfig {
        route: "settings",
        title: "Settings",
        items: &[
            item("LLM Providers", "/settings/llm"),
            item("General", "/settings/general"),
        ],
    },
    NavConfig {
        route: "users",
        title: "Users",
        items: &[
            item("Members", "/users"),
            item("Invitations", "/users/invitations"),
            item("Onboarding", "/users/onboarding"),
        ],
    },
];

/// Navigation for a route key, if the route has any
pub fn lookup(route: &str) -> Option<&'static NavConfig> {
    NAV.iter().find(|nav| nav.route == route)
}

/// Every configured route key
pub fn routes() -> impl Iterator<Item = &'static str> {
    NAV.iter().map(|nav| nav.route)
}
