//! Profile database bootstrap
//!
//! The API owns its schema; this only makes sure the database and the
//! account it logs in with exist and carry the current password.

use crate::host::Host;
use crate::model::{is_valid_sql_ident, DatabaseSpec};
use crate::{Error, Result};

/// Quote a value as a MySQL string literal
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// SQL applied by the local admin account. Every statement is idempotent.
pub fn bootstrap_sql(spec: &DatabaseSpec, password: &str) -> Result<String> {
    for ident in [&spec.name, &spec.user] {
        if !is_valid_sql_ident(ident) {
            return Err(Error::database(format!("invalid identifier '{}'", ident)));
        }
    }
    // The API connects over TCP to 127.0.0.1, which MySQL matches as 'localhost'
    // only for socket connections; grant both.
    let hosts = ["localhost", "127.0.0.1"];

    let mut sql = format!(
        "CREATE DATABASE IF NOT EXISTS `{db}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;\n",
        db = spec.name
    );
    for host in hosts {
        let account = format!("{}@{}", quote(&spec.user), quote(host));
        sql.push_str(&format!(
            "CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {pw};\n\
             ALTER USER {account} IDENTIFIED BY {pw};\n\
             GRANT ALL PRIVILEGES ON `{db}`.* TO {account};\n",
            account = account,
            pw = quote(password),
            db = spec.name
        ));
    }
    sql.push_str("FLUSH PRIVILEGES;\n");
    Ok(sql)
}

/// Create the database and account through `client` (the mysql CLI)
pub fn ensure_database(
    host: &dyn Host,
    client: &str,
    spec: &DatabaseSpec,
    password: &str,
) -> Result<()> {
    let sql = bootstrap_sql(spec, password)?;
    let output = host
        .run_with_input(client, &[], &sql)
        .map_err(|e| Error::database(format!("running {}: {}", client, e)))?;
    if !output.success() {
        return Err(Error::database(format!(
            "{} exited with {}: {}",
            client,
            output.exit_code,
            output.stderr.trim()
        )));
    }
    log::info!("database '{}' and user '{}' ready", spec.name, spec.user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::BackendKind;

    #[test]
    fn test_bootstrap_sql() {
        let spec = DatabaseSpec::for_backend(BackendKind::Amnezia);
        let sql = bootstrap_sql(&spec, "s3cr3t").unwrap();
        assert!(sql.starts_with("CREATE DATABASE IF NOT EXISTS `wg_panel`"));
        assert!(sql.contains("CREATE USER IF NOT EXISTS 'wg_user'@'localhost' IDENTIFIED BY 's3cr3t';"));
        assert!(sql.contains("ALTER USER 'wg_user'@'127.0.0.1' IDENTIFIED BY 's3cr3t';"));
        assert!(sql.contains("GRANT ALL PRIVILEGES ON `wg_panel`.* TO 'wg_user'@'localhost';"));
        assert!(sql.ends_with("FLUSH PRIVILEGES;\n"));
    }

    #[test]
    fn test_password_quoting() {
        assert_eq!(quote("a'b\\c"), "'a''b\\\\c'");
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let mut spec = DatabaseSpec::for_backend(BackendKind::Reality);
        spec.name = "x`; DROP".to_string();
        assert!(matches!(bootstrap_sql(&spec, "pw"), Err(Error::Database(_))));
    }

    #[test]
    fn test_ensure_database_runs_client() {
        let host = FakeHost::new();
        let spec = DatabaseSpec::for_backend(BackendKind::OpenVpn);
        ensure_database(&host, "mysql", &spec, "pw").unwrap();
        let sql = host.with(|s| s.sql.clone());
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("`ovpn_panel`"));

        let err = ensure_database(&host, "psql", &spec, "pw").unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }
}
