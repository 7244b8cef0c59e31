//! Bootstrap-script generation.
//!
//! `generate` is a pure function from a manifest to the first-boot shell
//! script a fresh node runs as root. Every shell-substituted value is either
//! single-quoted or base64-encoded; the script carries no secrets beyond what
//! the manifest itself holds.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use molt_manifest::Manifest;

/// Canonical manifest location on a provisioned node.
pub const MANIFEST_PATH: &str = "/opt/moltagent/manifest.json";

/// Fixed gateway port the worker binds on the node.
pub const GATEWAY_PORT: u16 = 18790;

/// Render the first-boot script for a manifest.
pub fn generate(manifest: &Manifest) -> String {
    let agent_id = &manifest.identity.id;
    let manifest_b64 = BASE64.encode(serde_json::to_vec(manifest).unwrap_or_default());

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str("set -euo pipefail\n");
    script.push_str("export DEBIAN_FRONTEND=noninteractive\n\n");

    // Base system
    script.push_str("apt-get update -qq\n");
    script.push_str("apt-get install -y -qq curl git ca-certificates gnupg jq\n");
    script.push_str("curl -fsSL https://deb.nodesource.com/setup_20.x | bash -\n");
    script.push_str("apt-get install -y -qq nodejs\n\n");

    if manifest.capabilities.web_browsing {
        script.push_str("# Headless browser stack\n");
        script.push_str(
            "apt-get install -y -qq chromium-browser fonts-liberation libnss3 libatk-bridge2.0-0 || apt-get install -y -qq chromium\n\n",
        );
    }

    if !manifest.capabilities.pip_packages.is_empty() {
        script.push_str("apt-get install -y -qq python3-pip\n\n");
    }

    if !manifest.capabilities.os_packages.is_empty() {
        script.push_str(&format!(
            "apt-get install -y -qq {}\n\n",
            quote_all(&manifest.capabilities.os_packages)
        ));
    }
    if !manifest.capabilities.npm_packages.is_empty() {
        script.push_str(&format!(
            "npm install -g {}\n\n",
            quote_all(&manifest.capabilities.npm_packages)
        ));
    }
    if !manifest.capabilities.pip_packages.is_empty() {
        script.push_str(&format!(
            "pip3 install {}\n\n",
            quote_all(&manifest.capabilities.pip_packages)
        ));
    }

    // Manifest, base64 on the wire to avoid shell-escaping hazards
    script.push_str("mkdir -p /opt/moltagent\n");
    script.push_str(&format!(
        "echo '{manifest_b64}' | base64 -d > {MANIFEST_PATH}\n"
    ));
    script.push_str(&format!("chmod 0600 {MANIFEST_PATH}\n\n"));

    for repo in &manifest.capabilities.git_repos {
        script.push_str(&format!(
            "git clone --branch {} {} {}\n",
            shell_quote(&repo.branch),
            shell_quote(&repo.url),
            shell_quote(&repo.path)
        ));
        if let Some(setup) = &repo.setup_command {
            script.push_str(&format!("(cd {} && {setup})\n", shell_quote(&repo.path)));
        }
    }
    if !manifest.capabilities.git_repos.is_empty() {
        script.push('\n');
    }

    script.push_str("npm install -g moltagent-worker\n\n");

    script.push_str("cat > /etc/systemd/system/moltagent-worker.service << 'UNIT_EOF'\n");
    script.push_str(&format!(
        "[Unit]\n\
         Description=MoltAgent Worker\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         [Service]\n\
         Type=simple\n\
         Environment=MOLTAGENT_MANIFEST={MANIFEST_PATH}\n\
         Environment=MOLTAGENT_ID={agent_id}\n\
         Environment=MOLTAGENT_GATEWAY_PORT={GATEWAY_PORT}\n\
         ExecStart=/usr/bin/env moltagent-worker\n\
         Restart=always\n\
         RestartSec=10\n\
         StandardOutput=journal\n\
         StandardError=journal\n\
         SyslogIdentifier=moltagent-worker\n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    ));
    script.push_str("UNIT_EOF\n");
    script.push_str(
        "systemctl daemon-reload && systemctl enable moltagent-worker && systemctl start moltagent-worker\n\n",
    );

    if let Some(base) = control_plane_http_base(&manifest.control_plane.url) {
        script.push_str("# Best-effort readiness ping\n");
        script.push_str(&format!(
            "curl -fsS -m 10 -X POST {}/moltagent/ready -H 'Content-Type: application/json' -d '{{\"agentId\":\"{agent_id}\"}}' || true\n",
            shell_quote(&base)
        ));
    }

    script.push_str(&format!(
        "echo 'moltagent bootstrap complete - agent {agent_id}'\n"
    ));
    script
}

/// Rewrite the control-plane WebSocket URL to an HTTP base (scheme swapped,
/// path and query dropped).
pub fn control_plane_http_base(ws_url: &str) -> Option<String> {
    let url = url::Url::parse(ws_url).ok()?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return None,
    };
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

fn shell_quote(value: &str) -> String {
    // POSIX single-quoting; embedded single quotes are closed, escaped, reopened.
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|v| shell_quote(v))
        .collect::<Vec<_>>()
        .join(" ")
}
