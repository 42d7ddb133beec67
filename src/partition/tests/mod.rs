pub mod helpers;
mod tests_crash;
mod tests_workers;
