// wire shape field names
pub const FIELD_ID: &str = "id";
pub const FIELD_COLLECTION: &str = "collection";
pub const FIELD_DATA: &str = "data";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";

// version constants
pub const UNSAVED_VERSION: i64 = 0;
pub const INITIAL_VERSION: i64 = 1;

// change event constants
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

// metrics constants
pub const NO_COLLECTION: &str = "-";

// connection parameter keys
pub const PARAM_URL: &str = "url";
pub const PARAM_USERNAME: &str = "username";
pub const PARAM_PASSWORD: &str = "password";

pub const ISOTOPE_VERSION: &str = env!("CARGO_PKG_VERSION");
