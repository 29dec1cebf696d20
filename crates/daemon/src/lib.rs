/**
 * Command-line interface: `run` plus the share
 *  and access-code management commands.
 */
pub mod cli;
/**
 * The TOML config file under the cirrus directory.
 */
pub mod config;
/**
 * Daemon assembly: the TCP listener, the outbound
 *  connector, and static peer announcement.
 */
pub mod daemon;
/**
 * On-disk JSON store backing share persistence.
 */
pub mod store;
