use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};

use crate::catalog::Cloud;
use crate::config::Config;
use crate::launch::{FormErrors, LaunchForm, LaunchRecord};
use crate::middleware::SessionId;
use crate::session::SessionStore;

const LOOPBACK_PREFIXES: [&str; 2] = ["http://127.0.0.1", "http://localhost"];

const FORM_SCRIPT: &str = r#"<script>
function post(url, data, done) {
  var xhr = new XMLHttpRequest();
  xhr.open("POST", url);
  xhr.setRequestHeader("X-Requested-With", "XMLHttpRequest");
  xhr.setRequestHeader("Content-Type", "application/x-www-form-urlencoded");
  xhr.onload = function () { done(JSON.parse(xhr.responseText)); };
  xhr.send(new URLSearchParams(data).toString());
}
function fill(select, options, blank) {
  var current = select.value;
  select.innerHTML = blank ? '<option value="">---------</option>' : "";
  options.forEach(function (o) {
    var opt = document.createElement("option");
    opt.value = o[0]; opt.textContent = o[1]; opt.selected = String(o[0]) === current;
    select.appendChild(opt);
  });
}
function byId(id) { return document.getElementById(id); }
function refreshFields() {
  post("/dynamic-fields", {cloud_id: byId("id_cloud").value}, function (state) {
    fill(byId("id_instance_type"), state.instance_types, false);
    fill(byId("id_image_id"), state.image_ids, true);
    refreshPlacements();
  });
}
function refreshPlacements() {
  post("/placements", {
    cloud_id: byId("id_cloud").value, a_key: byId("id_access_key").value,
    s_key: byId("id_secret_key").value, instance_type: byId("id_instance_type").value
  }, function (state) {
    byId("placement_error").textContent = state.error || "";
    fill(byId("id_placement"), state.placements.map(function (p) { return [p, p]; }), false);
  });
}
byId("id_cloud").addEventListener("change", refreshFields);
byId("id_instance_type").addEventListener("change", refreshPlacements);
byId("id_secret_key").addEventListener("blur", refreshPlacements);
refreshFields();
</script>"#;

const MONITOR_SCRIPT: &str = r#"<script>
function poll() {
  var xhr = new XMLHttpRequest();
  xhr.open("GET", "/instance-state");
  xhr.onload = function () {
    var state = JSON.parse(xhr.responseText);
    document.getElementById("instance_state").textContent = state.error || state.instance_state;
    if (state.public_ip) { document.getElementById("public_ip").textContent = state.public_ip; }
    if (state.instance_state !== "running" && !state.error) { setTimeout(poll, 5000); }
  };
  xhr.send();
}
poll();
</script>"#;

// -----------------------------------------------------------------------------
// Rendering
// -----------------------------------------------------------------------------

pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n{}\n</body>\n</html>\n",
        escape(title),
        body
    )
}

fn error_list(errors: &[String]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let items: String = errors
        .iter()
        .map(|error| format!("<li>{}</li>", escape(error)))
        .collect();
    format!("<ul class=\"errorlist\">{}</ul>", items)
}

fn text_input(name: &str, label: &str, kind: &str, value: &str, errors: &FormErrors) -> String {
    format!(
        "<p>{}<label for=\"id_{name}\">{}</label> <input type=\"{}\" id=\"id_{name}\" name=\"{name}\" value=\"{}\"></p>\n",
        error_list(errors.field(name)),
        escape(label),
        kind,
        escape(value),
        name = name,
    )
}

fn select(name: &str, label: &str, options: &str, errors: &FormErrors) -> String {
    format!(
        "<p>{}<label for=\"id_{name}\">{}</label> <select id=\"id_{name}\" name=\"{name}\">{}</select></p>\n",
        error_list(errors.field(name)),
        escape(label),
        options,
        name = name,
    )
}

fn current_option(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        format!("<option value=\"{0}\" selected>{0}</option>", escape(value))
    }
}

pub fn render_launch_form(clouds: &[Cloud], form: &LaunchForm, errors: &FormErrors) -> String {
    let cloud_options: String = clouds
        .iter()
        .map(|cloud| {
            let id = cloud.id.to_string();
            format!(
                "<option value=\"{}\"{}>{}</option>",
                id,
                if id == form.cloud { " selected" } else { "" },
                escape(&cloud.name)
            )
        })
        .collect();
    let image_options = format!(
        "<option value=\"\">---------</option>{}",
        current_option(&form.image_id)
    );

    let mut body = String::from("<h1>Launch a CloudMan cluster</h1>\n");
    body.push_str(&error_list(&errors.non_field));
    body.push_str("<form method=\"post\" action=\"/launch\">\n");
    body.push_str(&select("cloud", "Cloud", &cloud_options, errors));
    body.push_str(&text_input("access_key", "Access key", "text", &form.access_key, errors));
    // secrets are never echoed back
    body.push_str(&text_input("secret_key", "Secret key", "password", "", errors));
    body.push_str(&text_input("cluster_name", "Cluster name", "text", &form.cluster_name, errors));
    body.push_str(&text_input("password", "Cluster password", "password", "", errors));
    body.push_str(&select(
        "instance_type",
        "Instance type",
        &current_option(&form.instance_type),
        errors,
    ));
    body.push_str(&select("image_id", "Image", &image_options, errors));
    body.push_str(&select(
        "placement",
        "Placement",
        &current_option(&form.placement),
        errors,
    ));
    body.push_str("<p id=\"placement_error\" class=\"errorlist\"></p>\n");
    body.push_str("<p><input type=\"submit\" value=\"Launch\"></p>\n</form>\n");
    body.push_str(FORM_SCRIPT);

    page("Launch", &body)
}

pub fn render_monitor(record: Option<&LaunchRecord>) -> String {
    let record = match record {
        Some(record) => record,
        None => {
            return page(
                "Monitor",
                "<h1>No launch yet</h1>\n<p>Nothing has been launched in this session. <a href=\"/launch\">Launch an instance</a>.</p>",
            )
        }
    };

    let mut body = format!(
        "<h1>Cluster {}</h1>\n<dl>\n",
        escape(&record.cluster_name)
    );
    let rows = [
        ("Cloud", record.cloud.name.as_str()),
        ("Instance", record.instance_id.as_str()),
        ("Image", record.image_id.as_str()),
        ("Key pair", record.kp_name.as_str()),
        ("Security group", record.sg_name.as_str()),
    ];
    for (label, value) in rows {
        body.push_str(&format!("<dt>{}</dt><dd>{}</dd>\n", label, escape(value)));
    }
    body.push_str(&format!(
        "<dt>Public IP</dt><dd id=\"public_ip\">{}</dd>\n<dt>State</dt><dd id=\"instance_state\">pending</dd>\n</dl>\n",
        escape(record.public_ip.as_deref().unwrap_or(""))
    ));
    body.push_str("<p><a href=\"/user-data\">Download user data</a>");
    if record.kp_material.is_some() {
        body.push_str(" | <a href=\"/keypair\">Download private key</a>");
    }
    body.push_str("</p>\n");
    body.push_str(MONITOR_SCRIPT);

    page("Monitor", &body)
}

/// Whether the absolute launch URL points at this machine.
pub fn is_loopback_url(url: &str) -> bool {
    LOOPBACK_PREFIXES.iter().any(|prefix| url.starts_with(prefix))
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

/// Scheme of the connection itself; forwarding headers are ignored.
fn request_scheme(req: &HttpRequest) -> &'static str {
    if req.app_config().secure() {
        "https"
    } else {
        "http"
    }
}

/// The `Host` header, falling back to the server's configured host.
/// Forwarding headers are ignored so clients cannot steer the redirect.
fn request_host(req: &HttpRequest) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| req.app_config().host().to_string())
}

async fn home_handler(req: HttpRequest, config: web::Data<Config>) -> impl Responder {
    let launch_url = format!("{}://{}/launch", request_scheme(&req), request_host(&req));
    let target = if is_loopback_url(&launch_url) {
        "/launch"
    } else {
        config.public_launch_url.as_str()
    };

    HttpResponse::Found()
        .insert_header((header::LOCATION, target))
        .finish()
}

async fn monitor_handler(session: SessionId, sessions: web::Data<SessionStore>) -> impl Responder {
    let record = sessions.get_current(&session);

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_monitor(record.as_ref()))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(home_handler))
        .route("/monitor", web::get().to(monitor_handler));
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
