fn main() -> anyhow::Result<()> {
    bird_classifier_lib::cli()
}
