include!("admin/auth.rs");
include!("admin/accounts.rs");
include!("admin/keys.rs");
