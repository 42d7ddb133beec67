mod tests_dedup;
