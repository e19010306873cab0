//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory under the user's home where virshbox keeps its config and database.
pub const VIRSHBOX_HOME_DIR: &str = ".virshbox";

/// The default configuration filename.
pub const VIRSHBOX_CONFIG_FILENAME: &str = "virshbox.yaml";

/// The default sandbox database filename.
pub const SANDBOX_DB_FILENAME: &str = "sandboxes.db";

/// The filename of a clone's copy-on-write overlay disk inside its job directory.
pub const OVERLAY_DISK_FILENAME: &str = "disk-overlay.qcow2";

/// The filename of a clone's cloud-init seed image inside its job directory.
pub const SEED_ISO_FILENAME: &str = "cloud-init.iso";

/// The filename of the edited domain descriptor inside a job directory.
pub const DOMAIN_XML_FILENAME: &str = "domain.xml";

/// The sub directory of a job directory holding cloud-init seed sources.
pub const SEED_SOURCE_SUBDIR: &str = "cloud-init";

/// The prefix of external snapshot overlay files inside a job directory.
pub const SNAPSHOT_FILE_PREFIX: &str = "snap-";
