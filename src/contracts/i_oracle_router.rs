use ethers::prelude::abigen;

abigen!(
    IOracleRouter,
    r#"[
        function fallbackOracle() external view returns (address)
    ]"#
);
