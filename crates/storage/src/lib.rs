pub mod db;

pub use db::{
    create_db, create_memory_db, delete_rule, delete_vendor_mapping, get_all_categories,
    get_all_rules, get_all_vendor_mappings, get_enabled_rules, get_rule_by_id,
    get_vendor_mapping, load_category_store, load_rule_set, save_category, save_rule,
    save_vendor_mapping, set_category_visibility, set_rule_enabled, DbPool, StorageError,
};
