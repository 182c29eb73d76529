//! SQL statements used by the SQL store
//!
//! Placeholders are `?`, accepted by both MySQL and SQLite.

pub const USER_BY_REC_ID: &str = r#"
    SELECT REC_ID, EMAIL, HASHED_PASSPHRASE, ENABLED, SUSPENDED
    FROM AAA_USER
    WHERE REC_ID = ?
"#;

pub const USER_BY_EMAIL: &str = r#"
    SELECT REC_ID, EMAIL, HASHED_PASSPHRASE, ENABLED, SUSPENDED
    FROM AAA_USER
    WHERE EMAIL = ?
"#;

pub const GROUP_BY_REC_ID: &str = r#"
    SELECT REC_ID, GROUP_NAME, GROUP_DOMAIN, DESCRIPTION
    FROM AAA_GROUP
    WHERE REC_ID = ?
"#;

pub const ROLE_BY_REC_ID: &str = r#"
    SELECT REC_ID, ROLE_NAME, ROLE_DOMAIN, DESCRIPTION
    FROM AAA_ROLE
    WHERE REC_ID = ?
"#;

pub const GROUPS_OF_USER: &str = r#"
    SELECT G.REC_ID, G.GROUP_NAME, G.GROUP_DOMAIN, G.DESCRIPTION
    FROM AAA_GROUP G
    JOIN AAA_USER_GROUP UG ON UG.GROUP_REC_ID = G.REC_ID
    WHERE UG.USER_REC_ID = ?
    ORDER BY G.GROUP_NAME
"#;

pub const ROLES_OF_USER: &str = r#"
    SELECT R.REC_ID, R.ROLE_NAME, R.ROLE_DOMAIN, R.DESCRIPTION
    FROM AAA_ROLE R
    JOIN AAA_USER_ROLE UR ON UR.ROLE_REC_ID = R.REC_ID
    WHERE UR.USER_REC_ID = ?
    ORDER BY R.ROLE_NAME
"#;

pub const ROLES_OF_GROUP: &str = r#"
    SELECT R.REC_ID, R.ROLE_NAME, R.ROLE_DOMAIN, R.DESCRIPTION
    FROM AAA_ROLE R
    JOIN AAA_GROUP_ROLE GR ON GR.ROLE_REC_ID = R.REC_ID
    WHERE GR.GROUP_REC_ID = ?
    ORDER BY R.ROLE_NAME
"#;

pub const TENANT_BY_DOMAIN: &str = r#"
    SELECT REC_ID, NAME, DOMAIN, DESCRIPTION
    FROM AAA_TENANT
    WHERE DOMAIN = ?
"#;

pub const REVOKE_TOKEN: &str = r#"
    INSERT INTO AAA_REVOCATION (JTI, EXPIRES_AT)
    VALUES (?, ?)
"#;

pub const PURGE_EXPIRED_REVOCATIONS: &str = r#"
    DELETE FROM AAA_REVOCATION
    WHERE EXPIRES_AT < ?
"#;

pub const IS_REVOKED: &str = r#"
    SELECT COUNT(*) AS CNT
    FROM AAA_REVOCATION
    WHERE JTI = ?
"#;
