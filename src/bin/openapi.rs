use anyhow::Result;

// Print the OpenAPI spec for the API, used by docs tooling.
fn main() -> Result<()> {
    println!("{}", gardisto::api::openapi().to_pretty_json()?);

    Ok(())
}
