//! Route table: every externally visible method, declared once.
//!
//! A route names its HTTP binding, whether it needs a caller identity, the
//! one backend method it forwards to, the explicit field mapping from the
//! inbound request to the canonical payload, and how the backend result is
//! reshaped for clients.

use crate::domain::value::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

/// Whether a route needs a verified caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVerb {
    Get,
    Post,
    Delete,
}

impl HttpVerb {
    /// True for verbs that carry a JSON body
    pub fn has_body(self) -> bool {
        matches!(self, HttpVerb::Post)
    }
}

/// Where a canonical field is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// Path parameter with this name
    Path(&'static str),
    /// Query string parameter
    Query(&'static str),
    /// Top-level key of the JSON body
    Body(&'static str),
    /// The verified caller's subject id
    Identity,
}

/// Accepted shape of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// UTF-8 string with a length range in characters
    Str { min: usize, max: usize },
    /// Opaque identifier: 1-64 chars of `[A-Za-z0-9_-]`
    Id,
    Int { min: i64, max: i64 },
    Bool,
}

/// One entry of a route's field mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub source: FieldSource,
    /// Key in the canonical payload
    pub target: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    const fn new(source: FieldSource, target: &'static str, kind: FieldKind) -> Self {
        Self {
            source,
            target,
            kind,
            required: true,
        }
    }

    const fn path(name: &'static str, kind: FieldKind) -> Self {
        Self::new(FieldSource::Path(name), name, kind)
    }

    const fn query(name: &'static str, kind: FieldKind) -> Self {
        Self::new(FieldSource::Query(name), name, kind)
    }

    const fn body(name: &'static str, kind: FieldKind) -> Self {
        Self::new(FieldSource::Body(name), name, kind)
    }

    const fn identity(target: &'static str) -> Self {
        Self::new(FieldSource::Identity, target, FieldKind::Id)
    }

    /// Store under a different canonical key
    const fn to(self, target: &'static str) -> Self {
        Self { target, ..self }
    }

    const fn optional(self) -> Self {
        Self {
            required: false,
            ..self
        }
    }

    /// Name the client sees in validation errors
    pub fn external_name(&self) -> &'static str {
        match self.source {
            FieldSource::Path(name) | FieldSource::Query(name) | FieldSource::Body(name) => name,
            FieldSource::Identity => self.target,
        }
    }
}

/// Turns a backend result into the client-facing shape.
pub type Reshape = fn(Value) -> Value;

/// A single route declaration
#[derive(Debug, Clone)]
pub struct RouteSpec {
    /// Logical method name, e.g. `users.GetUser`; also the native RPC method
    pub name: &'static str,
    pub verb: HttpVerb,
    /// axum path pattern
    pub path: &'static str,
    pub access: Access,
    pub backend: &'static str,
    pub backend_method: &'static str,
    /// Re-issuing the call cannot change the outcome
    pub idempotent: bool,
    pub fields: &'static [FieldSpec],
    /// HTTP status on success
    pub success_status: u16,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub reshape: Reshape,
}

impl RouteSpec {
    pub fn is_public(&self) -> bool {
        self.access == Access::Public
    }

    /// Canonical keys filled from the caller identity
    pub fn identity_targets(&self) -> impl Iterator<Item = &'static str> {
        self.fields
            .iter()
            .filter(|f| f.source == FieldSource::Identity)
            .map(|f| f.target)
    }
}

const STR_NAME: FieldKind = FieldKind::Str { min: 1, max: 100 };
const LIMIT: FieldKind = FieldKind::Int { min: 1, max: 100 };
const CURSOR: FieldKind = FieldKind::Str { min: 1, max: 256 };

const REGISTER_FIELDS: &[FieldSpec] = &[
    FieldSpec::body("username", FieldKind::Str { min: 3, max: 32 }),
    FieldSpec::body("email", FieldKind::Str { min: 3, max: 254 }),
    FieldSpec::body("password", FieldKind::Str { min: 8, max: 128 }),
    FieldSpec::body("display_name", FieldKind::Str { min: 1, max: 64 }).optional(),
];
const LOGIN_FIELDS: &[FieldSpec] = &[
    FieldSpec::body("email", FieldKind::Str { min: 3, max: 254 }),
    FieldSpec::body("password", FieldKind::Str { min: 1, max: 128 }),
];
const GET_ME_FIELDS: &[FieldSpec] = &[
    FieldSpec::identity("user_id"),
];
const GET_USER_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("user_id", FieldKind::Id),
];
const CREATE_SERVER_FIELDS: &[FieldSpec] = &[
    FieldSpec::body("name", STR_NAME),
    FieldSpec::body("description", FieldKind::Str { min: 0, max: 1024 }).optional(),
    FieldSpec::identity("owner_id"),
];
const LIST_SERVERS_FIELDS: &[FieldSpec] = &[
    FieldSpec::identity("member_id"),
    FieldSpec::query("cursor", CURSOR).optional(),
    FieldSpec::query("limit", LIMIT).optional(),
];
const GET_SERVER_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("server_id", FieldKind::Id),
    FieldSpec::identity("requester_id"),
];
const JOIN_SERVER_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("server_id", FieldKind::Id),
    FieldSpec::identity("user_id"),
    FieldSpec::body("invite_code", FieldKind::Str { min: 1, max: 64 }).optional(),
];
const CREATE_MESSAGE_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("channel_id", FieldKind::Id),
    FieldSpec::body("content", FieldKind::Str { min: 1, max: 2000 }),
    FieldSpec::identity("author_id"),
];
const LIST_MESSAGES_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("channel_id", FieldKind::Id),
    FieldSpec::identity("requester_id"),
    FieldSpec::query("before", CURSOR).to("cursor").optional(),
    FieldSpec::query("limit", LIMIT).optional(),
];
const SEND_REQUEST_FIELDS: &[FieldSpec] = &[
    FieldSpec::body("to_user_id", FieldKind::Id),
    FieldSpec::identity("from_user_id"),
];
const ACCEPT_REQUEST_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("request_id", FieldKind::Id),
    FieldSpec::identity("user_id"),
];
const LIST_FRIENDS_FIELDS: &[FieldSpec] = &[
    FieldSpec::identity("user_id"),
    FieldSpec::query("cursor", CURSOR).optional(),
    FieldSpec::query("limit", LIMIT).optional(),
];
const REMOVE_FRIEND_FIELDS: &[FieldSpec] = &[
    FieldSpec::path("user_id", FieldKind::Id).to("friend_id"),
    FieldSpec::identity("user_id"),
];

const READ: Duration = Duration::from_secs(3);
const WRITE: Duration = Duration::from_secs(5);

/// All supported routes keyed by logical name
pub static ROUTES: LazyLock<HashMap<&'static str, RouteSpec>> = LazyLock::new(|| {
    let routes = [
        // --- users ---
        RouteSpec {
            name: "users.Register",
            verb: HttpVerb::Post,
            path: "/v1/users",
            access: Access::Public,
            backend: "users",
            backend_method: "users.CreateUser",
            idempotent: false,
            fields: REGISTER_FIELDS,
            success_status: 201,
            timeout: WRITE,
            reshape: user_view,
        },
        RouteSpec {
            name: "users.Login",
            verb: HttpVerb::Post,
            path: "/v1/sessions",
            access: Access::Public,
            backend: "users",
            backend_method: "users.Authenticate",
            idempotent: false,
            fields: LOGIN_FIELDS,
            success_status: 200,
            timeout: WRITE,
            reshape: session_view,
        },
        RouteSpec {
            name: "users.GetMe",
            verb: HttpVerb::Get,
            path: "/v1/me",
            access: Access::Required,
            backend: "users",
            backend_method: "users.GetUser",
            idempotent: true,
            fields: GET_ME_FIELDS,
            success_status: 200,
            timeout: READ,
            reshape: user_view,
        },
        RouteSpec {
            name: "users.GetUser",
            verb: HttpVerb::Get,
            path: "/v1/users/:user_id",
            access: Access::Required,
            backend: "users",
            backend_method: "users.GetUser",
            idempotent: true,
            fields: GET_USER_FIELDS,
            success_status: 200,
            timeout: READ,
            reshape: public_user_view,
        },
        // --- servers ---
        RouteSpec {
            name: "servers.CreateServer",
            verb: HttpVerb::Post,
            path: "/v1/servers",
            access: Access::Required,
            backend: "servers",
            backend_method: "servers.CreateServer",
            idempotent: false,
            fields: CREATE_SERVER_FIELDS,
            success_status: 201,
            timeout: WRITE,
            reshape: server_view,
        },
        RouteSpec {
            name: "servers.ListServers",
            verb: HttpVerb::Get,
            path: "/v1/servers",
            access: Access::Required,
            backend: "servers",
            backend_method: "servers.ListServers",
            idempotent: true,
            fields: LIST_SERVERS_FIELDS,
            success_status: 200,
            timeout: READ,
            reshape: server_list_view,
        },
        RouteSpec {
            name: "servers.GetServer",
            verb: HttpVerb::Get,
            path: "/v1/servers/:server_id",
            access: Access::Required,
            backend: "servers",
            backend_method: "servers.GetServer",
            idempotent: true,
            fields: GET_SERVER_FIELDS,
            success_status: 200,
            timeout: READ,
            reshape: server_view,
        },
        RouteSpec {
            name: "servers.JoinServer",
            verb: HttpVerb::Post,
            path: "/v1/servers/:server_id/members",
            access: Access::Required,
            backend: "servers",
            backend_method: "servers.AddMember",
            idempotent: false,
            fields: JOIN_SERVER_FIELDS,
            success_status: 201,
            timeout: WRITE,
            reshape: member_view,
        },
        // --- messages ---
        RouteSpec {
            name: "messages.CreateMessage",
            verb: HttpVerb::Post,
            path: "/v1/channels/:channel_id/messages",
            access: Access::Required,
            backend: "messages",
            backend_method: "messages.CreateMessage",
            idempotent: false,
            fields: CREATE_MESSAGE_FIELDS,
            success_status: 201,
            timeout: WRITE,
            reshape: message_view,
        },
        RouteSpec {
            name: "messages.ListMessages",
            verb: HttpVerb::Get,
            path: "/v1/channels/:channel_id/messages",
            access: Access::Required,
            backend: "messages",
            backend_method: "messages.ListMessages",
            idempotent: true,
            fields: LIST_MESSAGES_FIELDS,
            success_status: 200,
            timeout: READ,
            reshape: message_list_view,
        },
        // --- friends ---
        RouteSpec {
            name: "friends.SendRequest",
            verb: HttpVerb::Post,
            path: "/v1/friends/requests",
            access: Access::Required,
            backend: "friends",
            backend_method: "friends.CreateRequest",
            idempotent: false,
            fields: SEND_REQUEST_FIELDS,
            success_status: 201,
            timeout: WRITE,
            reshape: friend_request_view,
        },
        RouteSpec {
            name: "friends.AcceptRequest",
            verb: HttpVerb::Post,
            path: "/v1/friends/requests/:request_id/accept",
            access: Access::Required,
            backend: "friends",
            backend_method: "friends.AcceptRequest",
            idempotent: false,
            fields: ACCEPT_REQUEST_FIELDS,
            success_status: 200,
            timeout: WRITE,
            reshape: friend_request_view,
        },
        RouteSpec {
            name: "friends.ListFriends",
            verb: HttpVerb::Get,
            path: "/v1/friends",
            access: Access::Required,
            backend: "friends",
            backend_method: "friends.ListFriends",
            idempotent: true,
            fields: LIST_FRIENDS_FIELDS,
            success_status: 200,
            timeout: READ,
            reshape: friend_list_view,
        },
        RouteSpec {
            name: "friends.RemoveFriend",
            verb: HttpVerb::Delete,
            path: "/v1/friends/:user_id",
            access: Access::Required,
            backend: "friends",
            backend_method: "friends.RemoveFriend",
            idempotent: true,
            fields: REMOVE_FRIEND_FIELDS,
            success_status: 204,
            timeout: WRITE,
            reshape: empty_view,
        },
    ];

    routes.into_iter().map(|r| (r.name, r)).collect()
});

/// Look up a route by logical name
pub fn get_route(name: &str) -> Option<&'static RouteSpec> {
    ROUTES.get(name)
}

pub fn is_route_supported(name: &str) -> bool {
    ROUTES.contains_key(name)
}

/// Public routes bypass the auth gate
pub fn is_public_route(name: &str) -> bool {
    get_route(name).is_some_and(RouteSpec::is_public)
}

// ---------------------------------------------------------------------------
// Response reshaping
// ---------------------------------------------------------------------------

const SECRET_FIELDS: [&str; 2] = ["password_hash", "password"];

fn strip_secrets(mut value: Value) -> Value {
    for key in SECRET_FIELDS {
        value.remove(key);
    }
    value
}

fn rename_id(mut value: Value, to: &str) -> Value {
    if let Some(id) = value.remove("id") {
        value.insert(to, id);
    }
    value
}

/// Own profile: everything but secrets
pub fn user_view(value: Value) -> Value {
    rename_id(strip_secrets(value), "user_id")
}

/// Someone else's profile: no email either
pub fn public_user_view(value: Value) -> Value {
    let mut view = user_view(value);
    view.remove("email");
    view
}

pub fn session_view(mut value: Value) -> Value {
    if let Some(user) = value.remove("user") {
        value.insert("user", user_view(user));
    }
    strip_secrets(value)
}

pub fn server_view(value: Value) -> Value {
    rename_id(value, "server_id")
}

pub fn member_view(value: Value) -> Value {
    strip_secrets(value)
}

pub fn message_view(value: Value) -> Value {
    rename_id(value, "message_id")
}

pub fn friend_request_view(value: Value) -> Value {
    rename_id(value, "request_id")
}

/// Removals answer 204 with no body
pub fn empty_view(_value: Value) -> Value {
    Value::Null
}

/// Wrap a backend list as `{"items": [...], "next_cursor": ...}`.
///
/// Accepts either a bare list or a map holding `items` (or the first list
/// field) plus an optional `next_cursor`.
fn list_view(value: Value, item: Reshape) -> Value {
    let (items, next_cursor) = match value {
        Value::List(items) => (items, Value::Null),
        Value::Map(mut map) => {
            let cursor = map.remove("next_cursor").unwrap_or(Value::Null);
            let key = if map.contains_key("items") {
                Some("items".to_string())
            } else {
                map.iter()
                    .find(|(_, v)| matches!(v, Value::List(_)))
                    .map(|(k, _)| k.clone())
            };
            let items = match key.and_then(|k| map.remove(&k)) {
                Some(Value::List(items)) => items,
                _ => Vec::new(),
            };
            (items, cursor)
        }
        _ => (Vec::new(), Value::Null),
    };

    let mut view = Value::map();
    view.insert("items", Value::List(items.into_iter().map(item).collect()));
    view.insert("next_cursor", next_cursor);
    view
}

pub fn server_list_view(value: Value) -> Value {
    list_view(value, server_view)
}

pub fn message_list_view(value: Value) -> Value {
    list_view(value, message_view)
}

pub fn friend_list_view(value: Value) -> Value {
    list_view(value, public_user_view)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(v: serde_json::Value) -> Value {
        Value::from(v)
    }

    #[test]
    fn test_route_table_is_complete() {
        assert_eq!(ROUTES.len(), 14);
        for name in [
            "users.Register",
            "users.Login",
            "users.GetMe",
            "servers.JoinServer",
            "messages.ListMessages",
            "friends.RemoveFriend",
        ] {
            assert!(is_route_supported(name), "{name} missing");
        }
        assert!(!is_route_supported("users.DeleteEverything"));
    }

    #[test]
    fn test_public_routes() {
        assert!(is_public_route("users.Register"));
        assert!(is_public_route("users.Login"));
        assert!(!is_public_route("users.GetMe"));
        assert!(!is_public_route("unknown.Route"));

        let public: Vec<_> = ROUTES.values().filter(|r| r.is_public()).collect();
        assert_eq!(public.len(), 2);
    }

    #[test]
    fn test_http_bindings_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for route in ROUTES.values() {
            assert!(
                seen.insert((route.path, route.verb)),
                "{} duplicates an HTTP binding",
                route.name
            );
        }
    }

    #[test]
    fn test_protected_routes_bind_identity() {
        for route in ROUTES.values().filter(|r| !r.is_public()) {
            assert!(
                route.identity_targets().next().is_some(),
                "{} never uses the caller identity",
                route.name
            );
        }
    }

    #[test]
    fn test_success_statuses() {
        assert_eq!(get_route("servers.CreateServer").unwrap().success_status, 201);
        assert_eq!(get_route("friends.RemoveFriend").unwrap().success_status, 204);
        assert_eq!(get_route("servers.ListServers").unwrap().success_status, 200);
    }

    #[test]
    fn test_user_view_strips_secrets() {
        let view = user_view(json(serde_json::json!({
            "id": "u1",
            "username": "ada",
            "email": "ada@example.com",
            "password_hash": "$argon2id$..."
        })));
        let out: serde_json::Value = view.into();
        assert_eq!(
            out,
            serde_json::json!({"user_id": "u1", "username": "ada", "email": "ada@example.com"})
        );
    }

    #[test]
    fn test_public_user_view_hides_email() {
        let out: serde_json::Value = public_user_view(json(serde_json::json!({
            "id": "u2",
            "email": "x@example.com"
        })))
        .into();
        assert_eq!(out, serde_json::json!({"user_id": "u2"}));
    }

    #[test]
    fn test_session_view_cleans_nested_user() {
        let out: serde_json::Value = session_view(json(serde_json::json!({
            "token": "t",
            "user": {"id": "u1", "password_hash": "h"}
        })))
        .into();
        assert_eq!(out, serde_json::json!({"token": "t", "user": {"user_id": "u1"}}));
    }

    #[test]
    fn test_list_view_wraps_items() {
        let out: serde_json::Value = message_list_view(json(serde_json::json!({
            "messages": [{"id": "m1", "content": "hi"}],
            "next_cursor": "c2"
        })))
        .into();
        assert_eq!(
            out,
            serde_json::json!({
                "items": [{"message_id": "m1", "content": "hi"}],
                "next_cursor": "c2"
            })
        );

        let bare: serde_json::Value =
            server_list_view(json(serde_json::json!([{"id": "s1"}]))).into();
        assert_eq!(
            bare,
            serde_json::json!({"items": [{"server_id": "s1"}], "next_cursor": null})
        );
    }
}
