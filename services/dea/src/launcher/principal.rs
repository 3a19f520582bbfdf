//! OS principals that instance processes run as.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::sandbox::SandboxError;

const CREDENTIAL_LEN: usize = 32;

/// A generated password. Never logged or persisted.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Fresh random credential.
pub fn generate_credential() -> Credential {
    let secret: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect();
    Credential(secret)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_name: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    #[serde(skip)]
    pub credential: Option<Credential>,
}

#[async_trait]
pub trait PrincipalManager: Send + Sync {
    async fn create(&self, instance_id: &str) -> Result<Principal, SandboxError>;

    async fn delete(&self, principal: &Principal) -> Result<(), SandboxError>;

    /// Restrict `dir` so only `principal` can use it.
    async fn secure_directory(&self, principal: &Principal, dir: &Path) -> Result<(), SandboxError>;
}

fn user_name_for(instance_id: &str) -> String {
    let short: String = instance_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(16).collect();
    format!("dea-{short}")
}

/// Runs every instance as the agent's own user.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedPrincipals;

#[async_trait]
impl PrincipalManager for SharedPrincipals {
    async fn create(&self, instance_id: &str) -> Result<Principal, SandboxError> {
        Ok(Principal {
            user_name: user_name_for(instance_id),
            uid: None,
            gid: None,
            credential: Some(generate_credential()),
        })
    }

    async fn delete(&self, _principal: &Principal) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn secure_directory(&self, _principal: &Principal, dir: &Path) -> Result<(), SandboxError> {
        set_owner_only(dir).await
    }
}

/// Creates a locked-down system user per instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPrincipals;

async fn run(program: &str, args: &[&str]) -> Result<String, SandboxError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(SandboxError::Principal(format!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn lookup_id(flag: &str, user: &str) -> Result<u32, SandboxError> {
    let out = run("id", &[flag, user]).await?;
    out.parse()
        .map_err(|_| SandboxError::Principal(format!("unexpected id output for {user}: {out}")))
}

#[async_trait]
impl PrincipalManager for SystemPrincipals {
    async fn create(&self, instance_id: &str) -> Result<Principal, SandboxError> {
        let user_name = user_name_for(instance_id);
        run(
            "useradd",
            &["--system", "--no-create-home", "--shell", "/usr/sbin/nologin", user_name.as_str()],
        )
        .await?;

        let credential = generate_credential();
        let mut child = Command::new("chpasswd")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{user_name}:{}\n", credential.expose()).as_bytes())
                .await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            let _ = run("userdel", &[user_name.as_str()]).await;
            return Err(SandboxError::Principal(format!("chpasswd failed for {user_name}")));
        }

        let uid = lookup_id("-u", &user_name).await?;
        let gid = lookup_id("-g", &user_name).await?;
        info!(user = %user_name, uid = uid, "Created instance principal");
        Ok(Principal {
            user_name,
            uid: Some(uid),
            gid: Some(gid),
            credential: Some(credential),
        })
    }

    async fn delete(&self, principal: &Principal) -> Result<(), SandboxError> {
        match run("userdel", &[principal.user_name.as_str()]).await {
            Ok(_) => {
                debug!(user = %principal.user_name, "Deleted instance principal");
                Ok(())
            }
            // userdel exits 6 when the user does not exist.
            Err(SandboxError::Principal(msg)) if msg.contains("exit status: 6") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn secure_directory(&self, principal: &Principal, dir: &Path) -> Result<(), SandboxError> {
        #[cfg(unix)]
        {
            let uid = principal.uid;
            let gid = principal.gid;
            let root = dir.to_path_buf();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                for entry in walkdir::WalkDir::new(&root) {
                    let entry = entry.map_err(std::io::Error::other)?;
                    std::os::unix::fs::lchown(entry.path(), uid, gid)?;
                }
                Ok(())
            })
            .await
            .map_err(|e| SandboxError::Principal(e.to_string()))??;
        }
        set_owner_only(dir).await
    }
}

async fn set_owner_only(dir: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}
