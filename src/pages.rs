//! Page registry and the per-request page context.
//!
//! Pages are plain callbacks registered by URI. A handler fills a
//! [`PageContext`] (status, headers, output) and may hand the response body
//! to a streaming sender instead: a command's output or a shared buffer.
//! Whatever the page produced goes out through a [`Connection`] driven by
//! [`crate::io::body_stream`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::api::error::ApiError;
use crate::command::COMMAND_RESULT_NORMAL;
use crate::connection::{Connection, ConnectionHandler};
use crate::sender::{DataSender, StringSender};
use crate::server::WebServer;
use crate::session::{expired_session_cookie, session_cookie, Session};

/// Who may see a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageAuth {
    #[default]
    None,
    /// Requires a logged-in session.
    Cookie,
    /// Requires credentials from the credential store on every request.
    File,
}

/// Menu section a page is listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageMenu {
    #[default]
    None,
    Main,
    Config,
    Vehicle,
}

impl PageMenu {
    pub fn label(&self) -> &'static str {
        match self {
            PageMenu::None => "",
            PageMenu::Main => "Main",
            PageMenu::Config => "Config",
            PageMenu::Vehicle => "Vehicle",
        }
    }
}

pub type PageHandler = Arc<dyn Fn(&PageEntry, &mut PageContext) + Send + Sync>;

#[derive(Clone)]
pub struct PageEntry {
    pub uri: String,
    pub label: String,
    pub handler: PageHandler,
    pub menu: PageMenu,
    pub auth: PageAuth,
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("uri", &self.uri)
            .field("label", &self.label)
            .field("menu", &self.menu)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl PageEntry {
    pub fn new<F>(
        uri: impl Into<String>,
        label: impl Into<String>,
        menu: PageMenu,
        auth: PageAuth,
        handler: F,
    ) -> Self
    where
        F: Fn(&PageEntry, &mut PageContext) + Send + Sync + 'static,
    {
        Self {
            uri: uri.into(),
            label: label.into(),
            handler: Arc::new(handler),
            menu,
            auth,
        }
    }
}

/// Ordered page collection keyed by URI.
#[derive(Debug, Default)]
pub struct PageRegistry {
    entries: Vec<PageEntry>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: PageEntry) {
        match self.entries.iter_mut().find(|e| e.uri == entry.uri) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn deregister(&mut self, uri: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.uri != uri);
        self.entries.len() != before
    }

    pub fn find(&self, uri: &str) -> Option<&PageEntry> {
        self.entries.iter().find(|e| e.uri == uri)
    }

    pub fn entries(&self) -> &[PageEntry] {
        &self.entries
    }
}

/// Escape text for inclusion in HTML.
pub fn encode_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

enum PageBody {
    Output,
    Handler(Box<dyn ConnectionHandler>),
    Execute { command: String, verbosity: usize },
}

/// A labelled form input, rendered by [`PageContext::input`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InputField<'a> {
    pub kind: &'a str,
    pub label: &'a str,
    pub name: &'a str,
    pub value: &'a str,
    pub placeholder: Option<&'a str>,
    pub help: Option<&'a str>,
    /// Extra attributes, inserted verbatim.
    pub attrs: Option<&'a str>,
    pub unit: Option<&'a str>,
}

impl<'a> InputField<'a> {
    pub fn new(kind: &'a str, label: &'a str, name: &'a str, value: &'a str) -> Self {
        Self {
            kind,
            label,
            name,
            value,
            ..Self::default()
        }
    }

    pub fn placeholder(mut self, placeholder: &'a str) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn help(mut self, help: &'a str) -> Self {
        self.help = Some(help);
        self
    }

    pub fn attrs(mut self, attrs: &'a str) -> Self {
        self.attrs = Some(attrs);
        self
    }

    pub fn unit(mut self, unit: &'a str) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// A range input, rendered by [`PageContext::input_slider`].
#[derive(Debug, Clone, Copy)]
pub struct SliderField<'a> {
    pub label: &'a str,
    pub name: &'a str,
    pub unit: &'a str,
    /// `Some` adds a `<name>_enabled` checkbox in that state; a disabled
    /// slider is greyed out.
    pub enabled: Option<bool>,
    pub value: f64,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub help: Option<&'a str>,
}

impl<'a> SliderField<'a> {
    pub fn new(label: &'a str, name: &'a str, value: f64, min: f64, max: f64) -> Self {
        Self {
            label,
            name,
            unit: "",
            enabled: None,
            value,
            default: value,
            min,
            max,
            step: 1.0,
            help: None,
        }
    }
}

/// Request state and response builder handed to page handlers.
pub struct PageContext {
    pub method: Method,
    pub uri: String,
    pub session: Option<Session>,
    server: Arc<WebServer>,
    vars: HashMap<String, String>,
    status: StatusCode,
    headers: HeaderMap,
    output: String,
    body: PageBody,
    in_page: bool,
    conn: Connection,
}

impl PageContext {
    pub fn new(
        server: Arc<WebServer>,
        method: Method,
        uri: impl Into<String>,
        vars: HashMap<String, String>,
        session: Option<Session>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self {
            method,
            uri: uri.into(),
            session,
            server,
            vars,
            status: StatusCode::OK,
            headers,
            output: String::new(),
            body: PageBody::Output,
            in_page: false,
            conn: Connection::new(),
        }
    }

    pub fn server(&self) -> &Arc<WebServer> {
        &self.server
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Request variable (query or form field), cut to at most `maxlen` bytes.
    pub fn getvar(&self, name: &str, maxlen: usize) -> Option<String> {
        let value = self.vars.get(name)?;
        let mut end = value.len().min(maxlen);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        Some(value[..end].to_string())
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(_) => tracing::warn!(header = %name, "dropping invalid header value"),
        }
    }

    pub fn set_cookie(&mut self, cookie: &str) {
        if let Ok(v) = HeaderValue::from_str(cookie) {
            self.headers.append(header::SET_COOKIE, v);
        }
    }

    /// Start an HTML page.
    pub fn head(&mut self, status: StatusCode, title: &str) {
        self.status = status;
        self.in_page = true;
        self.output.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
        self.output.push_str("<title>");
        self.output.push_str(&encode_html(title));
        self.output.push_str("</title><link rel=\"stylesheet\" href=\"/assets/style.css\"></head><body>\n");
    }

    pub fn print(&mut self, s: &str) {
        self.output.push_str(s);
    }

    /// Close the HTML page opened by [`head`](Self::head).
    pub fn done(&mut self) {
        if self.in_page {
            self.output.push_str("\n</body></html>\n");
            self.in_page = false;
        }
    }

    /// Replace the response with an error page.
    pub fn error(&mut self, status: StatusCode, message: &str) {
        self.output.clear();
        self.in_page = false;
        self.body = PageBody::Output;
        self.set_header(header::CONTENT_TYPE, "text/html; charset=utf-8");
        self.head(status, "Error");
        self.output.push_str("<h1>Error</h1><p>");
        self.output.push_str(&encode_html(message));
        self.output.push_str("</p>");
        self.done();
    }

    pub fn redirect(&mut self, location: &str) {
        self.status = StatusCode::SEE_OTHER;
        self.set_header(header::LOCATION, location);
        self.output.clear();
        self.in_page = false;
    }

    pub fn json(&mut self, value: &serde_json::Value) {
        self.set_header(header::CONTENT_TYPE, "application/json");
        self.output = value.to_string();
    }

    /// Send a shared buffer as the body.
    pub fn send_data(&mut self, data: Bytes, content_type: &str) {
        self.set_header(header::CONTENT_TYPE, content_type);
        self.body = PageBody::Handler(Box::new(DataSender::new(data, true)));
    }

    /// Stream `command`'s output as the body while it runs.
    pub fn stream_command(&mut self, command: &str, verbosity: usize) {
        self.set_header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
        let stream = self.server.stream_command(command, verbosity, &self.conn);
        self.body = PageBody::Handler(Box::new(stream));
    }

    /// Run `command` to completion and send its whole output as the body.
    pub fn execute_command(&mut self, command: &str, verbosity: usize) {
        self.set_header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
        self.body = PageBody::Execute {
            command: command.to_string(),
            verbosity,
        };
    }

    pub async fn into_response(self) -> Response {
        let PageContext {
            server,
            status,
            headers,
            output,
            body,
            mut conn,
            ..
        } = self;

        let handler: Box<dyn ConnectionHandler> = match body {
            PageBody::Output => Box::new(StringSender::new(output, true)),
            PageBody::Handler(handler) => handler,
            PageBody::Execute { command, verbosity } => match server.execute_command(&command, verbosity).await {
                Ok(out) => Box::new(StringSender::new(out, true)),
                Err(e) => {
                    tracing::warn!(command = %command, error = %e, "command failed");
                    return ApiError::CommandFailed(e.to_string()).into_response();
                }
            },
        };
        if let Err(e) = conn.attach(handler) {
            return ApiError::InternalError(e.to_string()).into_response();
        }

        let mut response = Response::new(axum::body::Body::from_stream(crate::io::body_stream(conn)));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

// ── HTML output helpers ────────────────────────────────────────────
//
// Labels, values and texts are HTML-escaped; only `InputField::attrs` goes
// out verbatim.

impl PageContext {
    pub fn printf(&mut self, args: fmt::Arguments<'_>) {
        let _ = fmt::Write::write_fmt(self, args);
    }

    pub fn panel_start(&mut self, kind: &str, title: &str) {
        self.printf(format_args!(
            "<div class=\"panel panel-{}\"><div class=\"panel-heading\">{}</div><div class=\"panel-body\">\n",
            encode_html(kind),
            encode_html(title)
        ));
    }

    /// Close a panel; an empty `footer` leaves the footer out.
    pub fn panel_end(&mut self, footer: &str) {
        self.print("</div>");
        if !footer.is_empty() {
            self.printf(format_args!("<div class=\"panel-footer\">{}</div>", encode_html(footer)));
        }
        self.print("</div>\n");
    }

    pub fn form_start(&mut self, action: &str) {
        self.printf(format_args!("<form method=\"post\" action=\"{}\">\n", encode_html(action)));
    }

    pub fn form_end(&mut self) {
        self.print("</form>\n");
    }

    pub fn fieldset_start(&mut self, title: &str, class: Option<&str>) {
        match class {
            Some(class) => self.printf(format_args!("<fieldset class=\"{}\">", encode_html(class))),
            None => self.print("<fieldset>"),
        }
        self.printf(format_args!("<legend>{}</legend>\n", encode_html(title)));
    }

    pub fn fieldset_end(&mut self) {
        self.print("</fieldset>\n");
    }

    pub fn hr(&mut self) {
        self.print("<hr>\n");
    }

    fn field_start(&mut self, label: &str, name: Option<&str>) {
        match name {
            Some(name) => self.printf(format_args!(
                "<div class=\"form-group\"><label for=\"input-{}\">{}</label><div class=\"field\">",
                encode_html(name),
                encode_html(label)
            )),
            None => self.printf(format_args!(
                "<div class=\"form-group\"><label>{}</label><div class=\"field\">",
                encode_html(label)
            )),
        }
    }

    fn field_end(&mut self, help: Option<&str>) {
        if let Some(help) = help {
            self.printf(format_args!("<span class=\"help-block\">{}</span>", encode_html(help)));
        }
        self.print("</div></div>\n");
    }

    pub fn input(&mut self, field: InputField<'_>) {
        self.field_start(field.label, Some(field.name));
        let name = encode_html(field.name);
        self.printf(format_args!(
            "<input type=\"{}\" id=\"input-{name}\" name=\"{name}\" value=\"{}\"",
            encode_html(field.kind),
            encode_html(field.value)
        ));
        if let Some(placeholder) = field.placeholder {
            self.printf(format_args!(" placeholder=\"{}\"", encode_html(placeholder)));
        }
        if let Some(attrs) = field.attrs {
            self.print(" ");
            self.print(attrs);
        }
        self.print(">");
        if let Some(unit) = field.unit {
            self.printf(format_args!(" <span class=\"unit\">{}</span>", encode_html(unit)));
        }
        self.field_end(field.help);
    }

    pub fn input_text(&mut self, label: &str, name: &str, value: &str, placeholder: Option<&str>, help: Option<&str>) {
        self.input(InputField {
            placeholder,
            help,
            ..InputField::new("text", label, name, value)
        });
    }

    pub fn input_password(
        &mut self,
        label: &str,
        name: &str,
        value: &str,
        placeholder: Option<&str>,
        help: Option<&str>,
    ) {
        self.input(InputField {
            placeholder,
            help,
            ..InputField::new("password", label, name, value)
        });
    }

    pub fn input_select_start(&mut self, label: &str, name: &str) {
        self.field_start(label, Some(name));
        let name = encode_html(name);
        self.printf(format_args!("<select id=\"input-{name}\" name=\"{name}\">"));
    }

    pub fn input_select_option(&mut self, label: &str, value: &str, selected: bool) {
        self.printf(format_args!(
            "<option value=\"{}\"{}>{}</option>",
            encode_html(value),
            if selected { " selected" } else { "" },
            encode_html(label)
        ));
    }

    pub fn input_select_end(&mut self, help: Option<&str>) {
        self.print("</select>");
        self.field_end(help);
    }

    pub fn input_radio_start(&mut self, label: &str, name: &str) {
        self.field_start(label, None);
        self.printf(format_args!("<div class=\"radio-group\" id=\"input-{}\">", encode_html(name)));
    }

    pub fn input_radio_option(&mut self, name: &str, label: &str, value: &str, selected: bool) {
        self.printf(format_args!(
            "<label class=\"radio\"><input type=\"radio\" name=\"{}\" value=\"{}\"{}> {}</label>",
            encode_html(name),
            encode_html(value),
            if selected { " checked" } else { "" },
            encode_html(label)
        ));
    }

    pub fn input_radio_end(&mut self, help: Option<&str>) {
        self.print("</div>");
        self.field_end(help);
    }

    /// A checkbox posting `yes` when checked.
    pub fn input_checkbox(&mut self, label: &str, name: &str, checked: bool, help: Option<&str>) {
        self.printf(format_args!(
            "<div class=\"form-group\"><div class=\"field\"><label><input type=\"checkbox\" name=\"{}\" value=\"yes\"{}> {}</label>",
            encode_html(name),
            if checked { " checked" } else { "" },
            encode_html(label)
        ));
        self.field_end(help);
    }

    pub fn input_slider(&mut self, slider: SliderField<'_>) {
        self.field_start(slider.label, Some(slider.name));
        let name = encode_html(slider.name);
        if let Some(enabled) = slider.enabled {
            self.printf(format_args!(
                "<input type=\"checkbox\" name=\"{name}_enabled\" value=\"yes\"{}> ",
                if enabled { " checked" } else { "" }
            ));
        }
        self.printf(format_args!(
            "<input type=\"range\" id=\"input-{name}\" name=\"{name}\" value=\"{}\" min=\"{}\" max=\"{}\" step=\"{}\" data-default=\"{}\"{}>",
            slider.value,
            slider.min,
            slider.max,
            slider.step,
            slider.default,
            if slider.enabled == Some(false) { " disabled" } else { "" }
        ));
        if !slider.unit.is_empty() {
            self.printf(format_args!(" <span class=\"unit\">{}</span>", encode_html(slider.unit)));
        }
        self.field_end(slider.help);
    }

    /// A submit button styled as `btn-<kind>`.
    pub fn input_button(&mut self, kind: &str, label: &str, name: Option<&str>, value: Option<&str>) {
        self.printf(format_args!(
            "<div class=\"form-group\"><button type=\"submit\" class=\"btn btn-{}\"",
            encode_html(kind)
        ));
        if let Some(name) = name {
            self.printf(format_args!(" name=\"{}\"", encode_html(name)));
        }
        if let Some(value) = value {
            self.printf(format_args!(" value=\"{}\"", encode_html(value)));
        }
        self.printf(format_args!(">{}</button></div>\n", encode_html(label)));
    }

    /// A read-only form row.
    pub fn input_info(&mut self, label: &str, text: &str) {
        self.field_start(label, None);
        self.printf(format_args!("<p class=\"form-control-static\">{}</p>", encode_html(text)));
        self.field_end(None);
    }

    pub fn alert(&mut self, kind: &str, text: &str) {
        self.printf(format_args!(
            "<div class=\"alert alert-{}\">{}</div>\n",
            encode_html(kind),
            encode_html(text)
        ));
    }
}

impl fmt::Write for PageContext {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.output.push_str(s);
        Ok(())
    }
}

// ── Built-in pages ─────────────────────────────────────────────────

pub fn register_builtin(registry: &mut PageRegistry) {
    registry.register(PageEntry::new("/", "Home", PageMenu::Main, PageAuth::None, home_page));
    registry.register(PageEntry::new("/login", "Login", PageMenu::None, PageAuth::None, login_page));
    registry.register(PageEntry::new("/logout", "Logout", PageMenu::None, PageAuth::None, logout_page));
    registry.register(PageEntry::new(
        "/api/execute",
        "Shell",
        PageMenu::None,
        PageAuth::Cookie,
        execute_page,
    ));
    registry.register(PageEntry::new(
        "/api/metrics",
        "Metrics",
        PageMenu::Vehicle,
        PageAuth::Cookie,
        metrics_page,
    ));
    registry.register(PageEntry::new(
        "/api/config",
        "Config",
        PageMenu::Config,
        PageAuth::File,
        config_page,
    ));
}

fn home_page(entry: &PageEntry, ctx: &mut PageContext) {
    use fmt::Write;

    let server = ctx.server.clone();
    ctx.head(StatusCode::OK, &entry.label);
    ctx.print("<nav><ul>");
    for page in server.pages().iter().filter(|p| p.menu != PageMenu::None) {
        let _ = write!(
            ctx,
            "<li><a href=\"{}\">{}: {}</a></li>",
            encode_html(&page.uri),
            page.menu.label(),
            encode_html(&page.label)
        );
    }
    ctx.print("</ul></nav>");

    let _ = write!(
        ctx,
        "<p>{} metrics, {} live clients.</p>",
        server.metrics().len(),
        server.client_count()
    );
    if ctx.session.is_some() {
        ctx.print("<p>Logged in. <a href=\"/logout\">Logout</a></p>");
        ctx.print("<pre id=\"metrics\"></pre><script src=\"/assets/app.js\"></script>");
    } else {
        ctx.print("<p><a href=\"/login\">Login</a></p>");
    }
    ctx.done();
}

fn login_form(ctx: &mut PageContext, status: StatusCode, notice: Option<&str>) {
    ctx.head(status, "Login");
    if let Some(notice) = notice {
        let kind = if status.is_success() { "success" } else { "danger" };
        ctx.alert(kind, notice);
    }
    ctx.panel_start("primary", "Login");
    ctx.form_start("/login");
    ctx.input(InputField::new("text", "Username", "username", "").attrs("autocomplete=\"username\" autofocus"));
    ctx.input(InputField::new("password", "Password", "password", "").attrs("autocomplete=\"current-password\""));
    ctx.input_button("default", "Login", None, None);
    ctx.form_end();
    ctx.panel_end("");
    ctx.done();
}

fn login_page(_entry: &PageEntry, ctx: &mut PageContext) {
    if ctx.method != Method::POST {
        let notice = ctx.session.is_some().then_some("You are already logged in.");
        login_form(ctx, StatusCode::OK, notice);
        return;
    }

    let (Some(user), Some(password)) = (ctx.getvar("username", 64), ctx.getvar("password", 64)) else {
        login_form(ctx, StatusCode::BAD_REQUEST, Some("Username and password required."));
        return;
    };
    if !ctx.server.check_login(&user, &password) {
        tracing::warn!(user = %user, "login failed");
        login_form(ctx, StatusCode::UNAUTHORIZED, Some("Invalid username or password."));
        return;
    }
    let Some(session) = ctx.server.create_session() else {
        ctx.error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many active sessions. Try again later.",
        );
        return;
    };
    tracing::info!(user = %user, session = %session.id, "login");
    ctx.set_cookie(&session_cookie(session.id));
    ctx.session = Some(session);
    ctx.redirect("/");
}

fn logout_page(_entry: &PageEntry, ctx: &mut PageContext) {
    if let Some(session) = ctx.session.take() {
        ctx.server.destroy_session(&session);
        tracing::info!(session = %session.id, "logout");
    }
    ctx.set_cookie(&expired_session_cookie());
    ctx.redirect("/login");
}

fn execute_page(_entry: &PageEntry, ctx: &mut PageContext) {
    let Some(command) = ctx.getvar("command", 200).filter(|c| !c.trim().is_empty()) else {
        ctx.error(StatusCode::BAD_REQUEST, "Missing command.");
        return;
    };
    let verbosity = ctx
        .getvar("verbosity", 8)
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(COMMAND_RESULT_NORMAL);
    if ctx.getvar("output", 16).as_deref() == Some("buffer") {
        ctx.execute_command(&command, verbosity);
    } else {
        ctx.stream_command(&command, verbosity);
    }
}

fn metrics_page(_entry: &PageEntry, ctx: &mut PageContext) {
    let snapshot = serde_json::Value::Object(ctx.server.metrics().snapshot());
    ctx.json(&snapshot);
}

fn config_page(_entry: &PageEntry, ctx: &mut PageContext) {
    let Some(name) = ctx.getvar("name", 64) else {
        ctx.error(StatusCode::BAD_REQUEST, "Missing parameter name.");
        return;
    };
    if ctx.method == Method::POST {
        let (Some(instance), Some(value)) = (ctx.getvar("instance", 64), ctx.getvar("value", 256)) else {
            ctx.error(StatusCode::BAD_REQUEST, "Missing instance or value.");
            return;
        };
        let param = ctx.server.params().set_value(&name, &instance, &value);
        ctx.json(&serde_json::json!(param.as_ref()));
        return;
    }
    match ctx.server.params().get(&name) {
        Some(param) => ctx.json(&serde_json::json!(param.as_ref())),
        None => ctx.error(StatusCode::NOT_FOUND, "No such parameter."),
    }
}
