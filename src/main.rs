fn main() -> anyhow::Result<()> {
    cloud_migration_lib::run()
}
